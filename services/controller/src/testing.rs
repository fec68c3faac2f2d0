//! Shared fixtures for unit tests.

use std::path::PathBuf;

use chrono::Utc;
use rekon_id::{InstanceId, NodeName, ResourceName};

use crate::model::{
    BoundVolume, InstanceSpec, PodTemplate, ResourceLimits, ResourceSpec, VolumeMount,
};

pub(crate) fn node(name: &str) -> NodeName {
    NodeName::parse(name).unwrap()
}

/// Four-worker MPI job shape: one device each, a shared workdir and a
/// read-only dataset.
pub(crate) fn mpi_spec(replicas: i64) -> ResourceSpec {
    ResourceSpec {
        name: ResourceName::parse("mpi").unwrap(),
        replicas,
        template: PodTemplate {
            image: "mpi-tf-worker:latest".to_string(),
            resources: ResourceLimits { device_count: 1 },
            volume_mounts: vec![
                VolumeMount {
                    name: "workdir".to_string(),
                    host_path: PathBuf::from("/srv/shared"),
                    mount_path: PathBuf::from("/workdir"),
                    read_only: false,
                },
                VolumeMount {
                    name: "dataset".to_string(),
                    host_path: PathBuf::from("/srv/datasets/mnist"),
                    mount_path: PathBuf::from("/data"),
                    read_only: true,
                },
            ],
        },
    }
}

pub(crate) fn instance_spec(node_name: &str) -> InstanceSpec {
    let spec = mpi_spec(1);
    InstanceSpec {
        instance_id: InstanceId::new(),
        spec_name: spec.name.clone(),
        revision: 1,
        template_hash: spec.template.hash(),
        node: node(node_name),
        image: spec.template.image.clone(),
        devices: 1,
        volumes: vec![BoundVolume {
            name: "workdir".to_string(),
            host_path: PathBuf::from("/srv/shared"),
            mount_path: PathBuf::from("/workdir"),
            read_only: false,
        }],
        seq: 0,
        created_at: Utc::now(),
    }
}
