pub use prometheus;
pub use prometheus::{core::Collector, Registry};

/// Implemented by components that own prometheus collectors. Registration is
/// expected to happen exactly once per registry at wire-up time, hence the
/// expect on duplicate names.
pub trait RegistersMetrics {
    fn register_metrics(&self, registry: &Registry) {
        self.metrics().into_iter().for_each(|metric| {
            registry
                .register(metric)
                .expect("app to have correctly named metrics");
        });
    }

    fn metrics(&self) -> Vec<Box<dyn Collector>>;
}
