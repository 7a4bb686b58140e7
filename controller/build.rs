use catalog_types::{Broker, ServiceBinding, ServiceClass, ServiceInstance, ServicePlan};
use kube::CustomResourceExt;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    let crds: &[(&str, serde_yaml::Value)] = &[
        (
            "servicecatalog.example.io_brokers.yaml",
            serde_yaml::to_value(Broker::crd()).unwrap(),
        ),
        (
            "servicecatalog.example.io_serviceclasses.yaml",
            serde_yaml::to_value(ServiceClass::crd()).unwrap(),
        ),
        (
            "servicecatalog.example.io_serviceplans.yaml",
            serde_yaml::to_value(ServicePlan::crd()).unwrap(),
        ),
        (
            "servicecatalog.example.io_serviceinstances.yaml",
            serde_yaml::to_value(ServiceInstance::crd()).unwrap(),
        ),
        (
            "servicecatalog.example.io_servicebindings.yaml",
            serde_yaml::to_value(ServiceBinding::crd()).unwrap(),
        ),
    ];
    for (file_name, crd) in crds {
        fs::write(
            format!("../crds/{file_name}"),
            serde_yaml::to_string(crd).unwrap(),
        )
        .unwrap();
    }
}
