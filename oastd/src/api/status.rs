use anyhow::Context as _;
use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::AppState;
use crate::http::ApiError;

#[derive(Serialize)]
pub(crate) struct StatusResponse {
    #[serde(rename = "storedTests")]
    stored_tests: usize,
    #[serde(rename = "storedEvents")]
    stored_events: usize,
    #[serde(rename = "residentSetSizeBytes")]
    resident_set_size_bytes: u64,
    #[serde(rename = "openFileDescriptors")]
    open_file_descriptors: usize,
    #[serde(rename = "openFileDescriptorsLimit")]
    open_file_descriptors_limit: u64,
}

/// Process health snapshot: store counters plus memory and file-descriptor
/// usage.
pub(super) async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let process = process_status().map_err(|error| {
        info!("could not access process status");
        debug!(error = format!("{error:#}"), "process status error");
        ApiError::internal("could not access process status")
    })?;

    Ok(Json(StatusResponse {
        stored_tests: state.storage.total_tests(),
        stored_events: state.storage.total_events(),
        resident_set_size_bytes: process.resident_memory,
        open_file_descriptors: process.open_fds,
        open_file_descriptors_limit: process.fd_limit,
    }))
}

struct ProcessStatus {
    resident_memory: u64,
    open_fds: usize,
    fd_limit: u64,
}

fn process_status() -> anyhow::Result<ProcessStatus> {
    let pid = sysinfo::get_current_pid().map_err(|error| anyhow::anyhow!(error))?;

    let mut system = sysinfo::System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
    let process = system
        .process(pid)
        .context("current process not visible to sysinfo")?;

    let (open_fds, fd_limit) = fd_usage()?;

    Ok(ProcessStatus {
        resident_memory: process.memory(),
        open_fds,
        fd_limit,
    })
}

#[cfg(unix)]
fn fd_usage() -> anyhow::Result<(usize, u64)> {
    let open_fds = std::fs::read_dir("/proc/self/fd")
        .context("couldn't list /proc/self/fd")?
        .count();

    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes into the provided struct.
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error()).context("getrlimit failed");
    }

    Ok((open_fds, limit.rlim_cur))
}

#[cfg(not(unix))]
fn fd_usage() -> anyhow::Result<(usize, u64)> {
    anyhow::bail!("file descriptor accounting is only available on unix")
}
