use anyhow::{Context, Result};
use liblxcri::container::ContainerConfig;
use liblxcri::runtime::Runtime;
use liblxcri::utils::{self, Deadline};
use lxcri_cli::Create;
use oci_spec::runtime::Spec;

pub fn create(args: Create, rt: &Runtime, systemd_cgroup: bool) -> Result<()> {
    let spec_path = args.bundle.join(liblxcri::BUNDLE_CONFIG_FILE);
    let spec = Spec::load(&spec_path)
        .with_context(|| format!("failed to load container spec from {}", spec_path.display()))?;

    let config = ContainerConfig {
        container_id: args.container_id.clone(),
        bundle_path: args.bundle.clone(),
        spec,
        console_socket: args.console_socket.clone(),
        log_file: rt.log.container_log_file.clone(),
        log_level: rt.log.container_log_level.clone(),
        systemd_cgroup,
    };

    let deadline = super::deadline(args.timeout, rt.timeouts.create, "create");
    let container = match rt.create(config, &deadline) {
        Ok(container) => container,
        Err(err) => {
            // remove whatever state was left behind, with a fresh deadline
            // because create may have failed with a timeout
            tracing::error!(%err, "failed to create container");
            let deadline = Deadline::seconds(rt.timeouts.delete, "delete");
            match rt.delete(&args.container_id, true, &deadline) {
                Ok(()) | Err(liblxcri::LxcriError::NotExist) => {}
                Err(err) => tracing::error!(%err, "failed to destroy container"),
            }
            return Err(err.into());
        }
    };

    if let Some(pid_file) = &args.pid_file {
        let pid = container.monitor_pid.context("monitor pid is unset")?;
        utils::create_pid_file(pid_file, pid)
            .with_context(|| format!("failed to write pid file {}", pid_file.display()))?;
    }
    Ok(())
}
