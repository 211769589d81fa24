pub mod tracehub {
    tonic::include_proto!("tracehub");
}

pub mod sgroups {
    tonic::include_proto!("sgroups");
}
