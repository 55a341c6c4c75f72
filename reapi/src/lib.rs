//! Generated bindings for the Remote Execution API v2 wire protocol and the
//! auxiliary Google service definitions it builds on.
//!
//! The `.proto` sources are vendored under `protos/` and compiled by
//! `build.rs`; every package is exposed under its proto package path, with
//! [`remexec`] as a shorthand for the execution package itself.

pub mod build {
    pub mod bazel {
        pub mod remote {
            pub mod execution {
                pub mod v2 {
                    tonic::include_proto!("build.bazel.remote.execution.v2");
                }
            }
        }
        pub mod semver {
            tonic::include_proto!("build.bazel.semver");
        }
    }
}

pub mod google {
    pub mod bytestream {
        tonic::include_proto!("google.bytestream");
    }
    pub mod longrunning {
        tonic::include_proto!("google.longrunning");
    }
    pub mod rpc {
        tonic::include_proto!("google.rpc");
    }
}

pub use build::bazel::remote::execution::v2 as remexec;
pub use build::bazel::semver;
