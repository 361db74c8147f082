use kube::CustomResourceExt;

fn main() {
    print!(
        "{}",
        serde_yaml::to_string(&common::controlplane::ControlPlane::crd()).unwrap()
    );
}
