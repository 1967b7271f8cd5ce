//! # ib-sriov-cni - InfiniBand SR-IOV CNI plugin
//!
//! Invoked by the container runtime with `CNI_COMMAND` and friends in the
//! environment and the network configuration on stdin.
//!
//! ```text
//! CNI_COMMAND=ADD CNI_CONTAINERID=... CNI_NETNS=/var/run/netns/... \
//! CNI_IFNAME=net1 CNI_PATH=/opt/cni/bin ib-sriov-cni < net.conf
//! ```
//!
//! Stdout carries only the CNI result or error object; logs go to stderr or
//! the configured `logFile`.

use std::io::Read;
use std::process::ExitCode;

use ib_sriov_cni::cni::{ErrorResult, Invocation, Plugin, log_settings, output_version};
use ib_sriov_cni::{Error, logging};

fn fail(err: &Error, cni_version: &str) -> ExitCode {
    tracing::error!(code = err.cni_code(), error = %err, "Command failed");
    let encoded = ErrorResult::from_error(err, cni_version);
    match serde_json::to_string(&encoded) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("error: {err} (failed to encode error result: {e})"),
    }
    ExitCode::FAILURE
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let mut raw_config = Vec::new();
    if let Err(e) = std::io::stdin().read_to_end(&mut raw_config) {
        return fail(&Error::Io(e), &output_version(&[]));
    }
    let cni_version = output_version(&raw_config);

    let (log_level, log_file) = log_settings(&raw_config);
    if let Err(e) = logging::init(log_level.as_deref(), log_file.as_deref()) {
        eprintln!("warning: {e}");
    }

    let invocation = match Invocation::from_env() {
        Ok(invocation) => invocation,
        Err(e) => return fail(&e, &cni_version),
    };

    match Plugin::new().run(&invocation, &raw_config).await {
        Ok(Some(output)) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => fail(&e, &cni_version),
    }
}
