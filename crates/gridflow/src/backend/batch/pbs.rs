use std::fmt::Write;
use std::path::Path;

use crate::backend::JobStatus;
use crate::backend::batch::{BatchDialect, format_duration, script_body, stream_path};
use crate::run::{ReturnCode, RunState, Signal};
use crate::task::JobSpec;

/// PBS Professional / OpenPBS.
pub struct Pbs;

impl BatchDialect for Pbs {
    fn kind(&self) -> &'static str {
        "pbs"
    }

    fn submit_program(&self) -> &'static str {
        "qsub"
    }

    fn cancel_program(&self) -> &'static str {
        "qdel"
    }

    fn build_script(&self, name: &str, spec: &JobSpec, workdir: &Path) -> String {
        build_pbs_submit_script(name, spec, workdir)
    }

    fn parse_job_id(&self, output: &str) -> anyhow::Result<String> {
        output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(|line| line.to_string())
            .ok_or_else(|| anyhow::anyhow!("Missing job id in qsub output"))
    }

    fn status_command(&self, job_id: &str) -> Vec<String> {
        // -x will also display finished jobs
        ["qstat", "-f", job_id, "-F", "json", "-x"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn parse_status(&self, job_id: &str, output: &[u8]) -> anyhow::Result<Option<JobStatus>> {
        let data: serde_json::Value = serde_json::from_slice(output)
            .map_err(|e| anyhow::anyhow!("Cannot parse qstat JSON output: {e}"))?;
        let job = &data["Jobs"][job_id];
        if job.is_null() {
            return Ok(None);
        }
        Ok(Some(parse_job_status(job)?))
    }
}

fn parse_job_status(job: &serde_json::Value) -> anyhow::Result<JobStatus> {
    let state = job["job_state"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("JSON key Job state not found"))?;
    let status = match state {
        "Q" | "H" | "W" | "T" => JobStatus::new(RunState::Submitted),
        "R" | "E" | "B" => JobStatus::new(RunState::Running),
        "S" | "U" => JobStatus::new(RunState::Stopped),
        "F" | "X" => JobStatus::terminated(exit_status_to_returncode(
            job["Exit_status"].as_i64(),
        )),
        status => {
            log::warn!("Unknown PBS job status {status}");
            JobStatus::unknown()
        }
    };
    Ok(status)
}

/// PBS reports negative values for its own failures and `256 + signal` for jobs
/// killed by a signal.
fn exit_status_to_returncode(exit_status: Option<i64>) -> ReturnCode {
    match exit_status {
        None => ReturnCode::new(Signal::LOST, -1),
        Some(code) if code < 0 => ReturnCode::new(Signal::REMOTE_ERROR, -1),
        Some(code) if code >= 256 => ReturnCode::new((code - 256) as i32, -1),
        Some(code) => ReturnCode::from_shell_exit(code as i32),
    }
}

fn build_pbs_submit_script(name: &str, spec: &JobSpec, workdir: &Path) -> String {
    let mut select = format!("select=1:ncpus={}", spec.requested_cores);
    if let Some(memory) = spec.requested_memory {
        write!(select, ":mem={}gb", memory * spec.requested_cores as u64).unwrap();
    }

    let mut script = format!(
        r##"#!/bin/bash
#PBS -N {name}
#PBS -l {select}
#PBS -o {stdout}
"##,
        name = name,
        select = select,
        stdout = stream_path(workdir, spec.stdout.as_deref()),
    );
    if spec.join {
        script.push_str("#PBS -j oe\n");
    } else {
        writeln!(
            script,
            "#PBS -e {}",
            stream_path(workdir, spec.stderr.as_deref())
        )
        .unwrap();
    }
    if let Some(walltime) = spec.requested_walltime {
        writeln!(script, "#PBS -l walltime={}", format_duration(&walltime)).unwrap();
    }
    script.push_str(&script_body(spec, workdir));
    script
}

#[cfg(test)]
mod tests {
    use super::{Pbs, build_pbs_submit_script};
    use crate::backend::batch::BatchDialect;
    use crate::run::{ReturnCode, RunState, Signal};
    use crate::task::JobSpec;
    use std::path::Path;
    use std::time::Duration;

    fn qstat_output(state: &str, exit_status: Option<i64>) -> String {
        let exit = exit_status
            .map(|code| format!(r#", "Exit_status": {code}"#))
            .unwrap_or_default();
        format!(
            r#"{{"timestamp": 1700000000, "pbs_version": "2022.1",
                "Jobs": {{"1.server": {{"Job_Name": "gridflow-1", "job_state": "{state}"{exit}}}}}}}"#
        )
    }

    fn parse(state: &str, exit_status: Option<i64>) -> (RunState, Option<ReturnCode>) {
        let status = Pbs
            .parse_status("1.server", qstat_output(state, exit_status).as_bytes())
            .unwrap()
            .unwrap();
        (status.state, status.returncode)
    }

    #[test]
    fn test_parse_states() {
        assert_eq!(parse("Q", None).0, RunState::Submitted);
        assert_eq!(parse("H", None).0, RunState::Submitted);
        assert_eq!(parse("R", None).0, RunState::Running);
        assert_eq!(parse("E", None).0, RunState::Running);
        assert_eq!(parse("S", None).0, RunState::Stopped);
        assert_eq!(parse("Z", None).0, RunState::Unknown);
    }

    #[test]
    fn test_parse_finished() {
        assert_eq!(
            parse("F", Some(0)),
            (RunState::Terminated, Some(ReturnCode::OK))
        );
        assert_eq!(
            parse("F", Some(1)),
            (RunState::Terminated, Some(ReturnCode::exited(1)))
        );
        assert_eq!(
            parse("F", Some(265)),
            (RunState::Terminated, Some(ReturnCode::new(9, -1)))
        );
        assert_eq!(
            parse("F", Some(-3)),
            (
                RunState::Terminated,
                Some(ReturnCode::new(Signal::REMOTE_ERROR, -1))
            )
        );
    }

    #[test]
    fn test_missing_job() {
        assert!(
            Pbs.parse_status("2.server", qstat_output("R", None).as_bytes())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_submit_script() {
        let mut spec = JobSpec::new(["python", "run.py", "--name", "a b"]);
        spec.requested_cores = 4;
        spec.requested_memory = Some(2);
        spec.requested_walltime = Some(Duration::from_secs(5400));
        spec.environment.insert("MODE".to_string(), "fast".to_string());
        let script = build_pbs_submit_script("gridflow-1", &spec, Path::new("/spool/job"));
        assert_eq!(
            script,
            r#"#!/bin/bash
#PBS -N gridflow-1
#PBS -l select=1:ncpus=4:mem=8gb
#PBS -o /spool/job/stdout.txt
#PBS -e /spool/job/stderr.txt
#PBS -l walltime=01:30:00

cd /spool/job
export MODE=fast
python run.py --name 'a b'
"#
        );
    }
}
