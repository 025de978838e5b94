use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// Binds a namespace to its virtual network id.
///
/// `NetNamespace`s are created by the SDN master as namespaces are created. Unlike most
/// resources, the payload lives at the top level of the object rather than in a `spec`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct NetNamespace {
    pub metadata: ObjectMeta,

    /// The name of the namespace this object describes.
    pub netname: String,

    /// The namespace's virtual network id.
    pub netid: u32,
}

impl NetNamespace {
    pub fn new(name: impl ToString, netid: u32) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            netname: name.to_string(),
            netid,
        }
    }
}

impl k8s_openapi::Resource for NetNamespace {
    const API_VERSION: &'static str = "network.openshift.io/v1";
    const GROUP: &'static str = "network.openshift.io";
    const KIND: &'static str = "NetNamespace";
    const VERSION: &'static str = "v1";
    const URL_PATH_SEGMENT: &'static str = "netnamespaces";
    type Scope = k8s_openapi::ClusterResourceScope;
}

impl k8s_openapi::Metadata for NetNamespace {
    type Ty = ObjectMeta;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
