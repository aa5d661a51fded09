use std::fmt::Write;
use std::path::Path;

use bstr::ByteSlice;

use crate::Map;
use crate::backend::JobStatus;
use crate::backend::batch::{BatchDialect, format_duration, script_body, stream_path};
use crate::run::{ReturnCode, RunState, Signal};
use crate::task::JobSpec;

pub struct Slurm;

impl BatchDialect for Slurm {
    fn kind(&self) -> &'static str {
        "slurm"
    }

    fn submit_program(&self) -> &'static str {
        "sbatch"
    }

    fn cancel_program(&self) -> &'static str {
        "scancel"
    }

    fn build_script(&self, name: &str, spec: &JobSpec, workdir: &Path) -> String {
        build_slurm_submit_script(name, spec, workdir)
    }

    fn parse_job_id(&self, output: &str) -> anyhow::Result<String> {
        log::debug!("Sbatch output: {output}");
        output
            .lines()
            .map(|l| l.trim())
            .find(|l| l.to_lowercase().starts_with("submitted batch job"))
            .and_then(|l| l.split(' ').nth(3))
            .map(|l| l.to_string())
            .ok_or_else(|| anyhow::anyhow!("Missing job id in sbatch output\n{output}"))
    }

    fn status_command(&self, job_id: &str) -> Vec<String> {
        ["scontrol", "show", "job", job_id]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn parse_status(&self, job_id: &str, output: &[u8]) -> anyhow::Result<Option<JobStatus>> {
        let output = output
            .to_str()
            .map_err(|err| anyhow::anyhow!("Invalid UTF-8 in scontrol output: {:?}", err))?;
        let items = get_scontrol_items(output);
        match items.get("JobId") {
            Some(id) if *id == job_id => {}
            _ => return Ok(None),
        }
        parse_slurm_status(&items).map(Some)
    }
}

/// Parse <key>=<value> pairs from the output of `scontrol show job <job-id>`.
pub fn get_scontrol_items(output: &str) -> Map<&str, &str> {
    let mut map = Map::new();
    for line in output.lines() {
        for item in line.trim().split(' ') {
            let iter: Vec<_> = item.splitn(2, '=').collect();
            if iter.len() < 2 {
                continue;
            }
            let (key, value) = (iter[0], iter[1]);
            map.insert(key, value);
        }
    }
    map
}

fn parse_slurm_status(items: &Map<&str, &str>) -> anyhow::Result<JobStatus> {
    let status = items
        .get("JobState")
        .ok_or_else(|| anyhow::anyhow!("Missing key JobState in Slurm scontrol output"))?;
    let status = match *status {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "RESIZING" => {
            JobStatus::new(RunState::Submitted)
        }
        "RUNNING" | "COMPLETING" => JobStatus::new(RunState::Running),
        "SUSPENDED" | "STOPPED" => JobStatus::new(RunState::Stopped),
        "COMPLETED" | "FAILED" => JobStatus::terminated(parse_exit_code(items.get("ExitCode"))?),
        "CANCELLED" | "TIMEOUT" | "NODE_FAIL" | "PREEMPTED" | "BOOT_FAIL" | "DEADLINE"
        | "OUT_OF_MEMORY" => {
            let returncode = parse_exit_code(items.get("ExitCode"))?;
            // killed by the scheduler, the program itself may have exited cleanly
            let returncode = if returncode.is_ok() {
                ReturnCode::new(Signal::REMOTE_KILL, -1)
            } else {
                returncode
            };
            JobStatus::terminated(returncode)
        }
        status => {
            log::warn!("Unknown Slurm job status {status}");
            JobStatus::unknown()
        }
    };
    Ok(status)
}

/// Slurm reports `<exit code>:<signal>`.
fn parse_exit_code(value: Option<&&str>) -> anyhow::Result<ReturnCode> {
    let Some(value) = value else {
        return Ok(ReturnCode::new(Signal::LOST, -1));
    };
    let (code, signal) = value
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("Invalid Slurm exit code {value}"))?;
    let code: i32 = code.parse()?;
    let signal: i32 = signal.parse()?;
    Ok(if signal != 0 {
        ReturnCode::new(signal, -1)
    } else {
        ReturnCode::exited(code)
    })
}

fn build_slurm_submit_script(name: &str, spec: &JobSpec, workdir: &Path) -> String {
    let stdout = stream_path(workdir, spec.stdout.as_deref());
    let stderr = if spec.join {
        stdout.clone()
    } else {
        stream_path(workdir, spec.stderr.as_deref())
    };
    let mut script = format!(
        r##"#!/bin/bash
#SBATCH --job-name={name}
#SBATCH --output={stdout}
#SBATCH --error={stderr}
#SBATCH --ntasks=1
#SBATCH --cpus-per-task={cores}
"##,
        name = name,
        stdout = stdout,
        stderr = stderr,
        cores = spec.requested_cores,
    );
    if let Some(memory) = spec.requested_memory {
        writeln!(script, "#SBATCH --mem-per-cpu={memory}G").unwrap();
    }
    if let Some(walltime) = spec.requested_walltime {
        writeln!(script, "#SBATCH --time={}", format_duration(&walltime)).unwrap();
    }
    script.push_str(&script_body(spec, workdir));
    script
}
