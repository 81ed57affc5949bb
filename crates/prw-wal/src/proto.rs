pub mod prometheus {
    include!(concat!(env!("OUT_DIR"), "/prometheus.rs"));
}

pub use prometheus::{Label, Sample, TimeSeries, WriteRequest};
