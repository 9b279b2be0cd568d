use crate::SharedIndex;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(SharedIndex);

pub fn register(reg: &mut Registry, index: SharedIndex) {
    reg.register_collector(Box::new(Instrumented(index)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0.read();

        let mut pods_encoder = encoder.encode_descriptor(
            "pod_index_size",
            "The number of pods in the index",
            None,
            MetricType::Gauge,
        )?;
        for (ns, index) in &this.namespaces {
            let labels = [("namespace", ns.as_str())];
            let pods = ConstGauge::new(index.pods.len() as u32);
            let pods_encoder = pods_encoder.encode_family(&labels)?;
            pods.encode(pods_encoder)?;
        }

        let mut policies_encoder = encoder.encode_descriptor(
            "network_policy_index_size",
            "The number of network policies in the index",
            None,
            MetricType::Gauge,
        )?;
        for (ns, index) in &this.namespaces {
            let labels = [("namespace", ns.as_str())];
            let policies = ConstGauge::new(index.policies.len() as u32);
            let policies_encoder = policies_encoder.encode_family(&labels)?;
            policies.encode(policies_encoder)?;
        }

        let namespaces = ConstGauge::new(this.namespaces.len() as u32);
        let namespaces_encoder = encoder.encode_descriptor(
            "namespace_index_size",
            "The number of namespaces in the index",
            None,
            MetricType::Gauge,
        )?;
        namespaces.encode(namespaces_encoder)?;

        let installed = ConstGauge::new(this.num_policies() as u32);
        let installed_encoder = encoder.encode_descriptor(
            "policies_installed",
            "The number of policies realized in the packet filter",
            None,
            MetricType::Gauge,
        )?;
        installed.encode(installed_encoder)?;

        Ok(())
    }
}
