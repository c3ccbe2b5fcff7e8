use perm8s_operator::crd::{Group, SynchronisationSource, User};

use kube::CustomResourceExt;

fn main() {
    for crd in [Group::crd(), User::crd(), SynchronisationSource::crd()] {
        // safe unwrap: we know CRD is serializable
        print!("---\n{}\n", serde_yaml::to_string(&crd).unwrap());
    }
}
