//! OCI hook execution.
//!
//! Hooks are kept as a map from phase tag to an ordered list of hook
//! invocations. Runtime-level hooks are prepended to the hooks from the
//! spec. The merged map is serialized to `hooks.json` so the engine-side
//! hook binary can run the create/start phases; the runtime itself runs
//! `poststart` and `poststop`.

use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::os::unix::prelude::CommandExt;
use std::process;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use oci_spec::runtime::{Hook, Hooks};
use serde::{Deserialize, Serialize};

use crate::container::OciState;
use crate::utils::Deadline;
use crate::{LxcriError, Result};

/// The OCI lifecycle phases a hook can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookPhase {
    Prestart,
    CreateRuntime,
    CreateContainer,
    StartContainer,
    Poststart,
    Poststop,
}

impl HookPhase {
    /// A timeout or failure aborts the verb for all phases that run before
    /// the container process executes. Poststart/poststop failures are
    /// logged and tolerated.
    pub fn must_succeed(&self) -> bool {
        !matches!(self, HookPhase::Poststart | HookPhase::Poststop)
    }
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HookPhase::Prestart => "prestart",
            HookPhase::CreateRuntime => "createRuntime",
            HookPhase::CreateContainer => "createContainer",
            HookPhase::StartContainer => "startContainer",
            HookPhase::Poststart => "poststart",
            HookPhase::Poststop => "poststop",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("failed to execute hook command")]
    CommandExecute(#[source] std::io::Error),
    #[error("failed to write container state to stdin")]
    WriteContainerState(#[source] std::io::Error),
    #[error("failed to encode container state")]
    EncodeContainerState(#[source] serde_json::Error),
    #[error("hook command exited with non-zero exit code: {0}")]
    NonZeroExitCode(i32),
    #[error("hook command was killed by a signal")]
    Killed,
    #[error("hook command timed out")]
    Timeout,
}

/// Returns the hooks registered for the given phase, oldest first.
pub fn hooks_for(hooks: &Hooks, phase: HookPhase) -> &[Hook] {
    let list = match phase {
        #[allow(deprecated)]
        HookPhase::Prestart => hooks.prestart(),
        HookPhase::CreateRuntime => hooks.create_runtime(),
        HookPhase::CreateContainer => hooks.create_container(),
        HookPhase::StartContainer => hooks.start_container(),
        HookPhase::Poststart => hooks.poststart(),
        HookPhase::Poststop => hooks.poststop(),
    };
    list.as_deref().unwrap_or(&[])
}

fn merged(runtime: &[Hook], spec: &[Hook]) -> Option<Vec<Hook>> {
    if runtime.is_empty() && spec.is_empty() {
        return None;
    }
    let mut all = Vec::with_capacity(runtime.len() + spec.len());
    all.extend_from_slice(runtime);
    all.extend_from_slice(spec);
    Some(all)
}

/// Merges runtime-level hooks with the hooks from the spec. The runtime
/// hooks run first within each phase.
pub fn merge_hooks(runtime: &Hooks, spec: Option<&Hooks>) -> Hooks {
    let empty = Hooks::default();
    let spec = spec.unwrap_or(&empty);

    let mut hooks = Hooks::default();
    #[allow(deprecated)]
    hooks.set_prestart(merged(
        hooks_for(runtime, HookPhase::Prestart),
        hooks_for(spec, HookPhase::Prestart),
    ));
    hooks.set_create_runtime(merged(
        hooks_for(runtime, HookPhase::CreateRuntime),
        hooks_for(spec, HookPhase::CreateRuntime),
    ));
    hooks.set_create_container(merged(
        hooks_for(runtime, HookPhase::CreateContainer),
        hooks_for(spec, HookPhase::CreateContainer),
    ));
    hooks.set_start_container(merged(
        hooks_for(runtime, HookPhase::StartContainer),
        hooks_for(spec, HookPhase::StartContainer),
    ));
    hooks.set_poststart(merged(
        hooks_for(runtime, HookPhase::Poststart),
        hooks_for(spec, HookPhase::Poststart),
    ));
    hooks.set_poststop(merged(
        hooks_for(runtime, HookPhase::Poststop),
        hooks_for(spec, HookPhase::Poststop),
    ));
    hooks
}

fn parse_hook_env(env: &[String]) -> HashMap<String, String> {
    env.iter()
        .filter_map(|kv| {
            kv.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

fn run_hook(hook: &Hook, state_json: &str, deadline: &Deadline) -> std::result::Result<(), HookError> {
    let mut command = process::Command::new(hook.path());

    // The first element of args is arg0 which may differ from the path.
    if let Some((arg0, args)) = hook.args().as_ref().and_then(|a| a.split_first()) {
        command.arg0(arg0).args(args);
    } else {
        command.arg0(hook.path());
    }

    let envs = parse_hook_env(hook.env().as_deref().unwrap_or(&[]));

    let mut child = command
        .env_clear()
        .envs(envs)
        .stdin(process::Stdio::piped())
        .spawn()
        .map_err(HookError::CommandExecute)?;
    let child_pid = Pid::from_raw(child.id() as i32);

    // The container state is piped into the hook through stdin. BrokenPipe
    // means the hook finished without reading it, which is not an error.
    if let Some(stdin) = &mut child.stdin {
        if let Err(err) = stdin.write_all(state_json.as_bytes()) {
            if err.kind() != ErrorKind::BrokenPipe {
                let _ = signal::kill(child_pid, Signal::SIGKILL);
                return Err(HookError::WriteContainerState(err));
            }
        }
    }
    drop(child.stdin.take());

    // The hook's own timeout is bounded by the verb deadline. The wait runs
    // in a separate thread so the main thread can enforce the timeout; the
    // channel provides recv_timeout out of the box.
    let timeout = match hook.timeout() {
        Some(secs) => Duration::from_secs(secs.max(0) as u64),
        None => Duration::from_secs(u64::MAX / 2),
    };
    let timeout = match deadline.remaining() {
        Ok(remaining) => timeout.min(remaining),
        Err(_) => return Err(HookError::Timeout),
    };

    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(child.wait());
    });

    let status = match rx.recv_timeout(timeout) {
        Ok(status) => status.map_err(HookError::CommandExecute)?,
        Err(_) => {
            let _ = signal::kill(child_pid, Signal::SIGKILL);
            return Err(HookError::Timeout);
        }
    };

    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(HookError::NonZeroExitCode(code)),
        None => Err(HookError::Killed),
    }
}

/// Runs all hooks of the given phase sequentially with the container state
/// on stdin. Errors abort the verb for pre-start phases and are logged
/// otherwise.
pub fn run_hooks(
    phase: HookPhase,
    hooks: &[Hook],
    state: &OciState,
    deadline: &Deadline,
) -> Result<()> {
    if hooks.is_empty() {
        return Ok(());
    }
    let state_json = serde_json::to_string(state).map_err(|err| LxcriError::HookFailed {
        phase,
        source: HookError::EncodeContainerState(err),
    })?;

    for hook in hooks {
        tracing::debug!(%phase, path = ?hook.path(), "running hook");
        if let Err(err) = run_hook(hook, &state_json, deadline) {
            if phase.must_succeed() {
                return Err(LxcriError::HookFailed { phase, source: err });
            }
            tracing::warn!(%phase, path = ?hook.path(), %err, "hook failed");
        }
    }
    Ok(())
}
