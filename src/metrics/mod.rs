use lazy_static::lazy_static;
use prometheus::IntCounter;
use prometheus::Opts;

lazy_static! {
    pub static ref MSGS_QUEUED: IntCounter =
        IntCounter::with_opts(Opts::new("walrep_msgs_queued", "messages handed to the transport writer"))
            .expect("metric can not be created");

    pub static ref MSGS_DROPPED: IntCounter =
        IntCounter::with_opts(Opts::new("walrep_msgs_dropped", "broadcast messages dropped on a full outbound queue"))
            .expect("metric can not be created");

    pub static ref CONNECTION_DROPS: IntCounter =
        IntCounter::with_opts(Opts::new("walrep_connection_drops", "connections busted after an I/O failure"))
            .expect("metric can not be created");

    pub static ref BULK_OVERFLOWS: IntCounter =
        IntCounter::with_opts(Opts::new("walrep_bulk_overflows", "records too large for the bulk buffer, sent as singletons"))
            .expect("metric can not be created");

    pub static ref BULK_FILLS: IntCounter =
        IntCounter::with_opts(Opts::new("walrep_bulk_fills", "bulk buffers flushed because the next record did not fit"))
            .expect("metric can not be created");

    pub static ref BULK_TRANSFERS: IntCounter =
        IntCounter::with_opts(Opts::new("walrep_bulk_transfers", "bulk buffers transmitted"))
            .expect("metric can not be created");

    pub static ref GAP_REQUESTS: IntCounter =
        IntCounter::with_opts(Opts::new("walrep_gap_requests", "missing-record requests issued"))
            .expect("metric can not be created");

    pub static ref PERM_FAILED: IntCounter =
        IntCounter::with_opts(Opts::new("walrep_perm_failed", "durability waits that returned unavailable"))
            .expect("metric can not be created");
}
