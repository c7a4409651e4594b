// Runner script generation.
//
// Each task runs inside a freshly built virtualenv driven by a generated
// bash script. The script installs the task's package lists, emits the
// single-line JSON status fragments the metadata scraper consumes, runs the
// task file, and propagates its exit code.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use drover_core::Request;
use serde_json::json;

use crate::error::{Result, RunnerError};
use crate::workspace::TaskWorkspace;

/// Package lists after grooming, plus the studioml self-install override.
#[derive(Debug, Default, PartialEq)]
pub struct GroomedPackages {
    pub general: Vec<String>,
    pub configured: Vec<String>,
    pub studio_pip: Option<String>,
    pub tf_version: Option<String>,
}

/// Scan both package lists, pulling the studioml install aside, dropping the
/// broken distro `pkg-resources` stub, and swapping `tensorflow` for its GPU
/// build when the task was granted GPUs and did not already pin one.
pub fn groom_packages(request: &Request, has_gpu: bool) -> GroomedPackages {
    let mut out = GroomedPackages::default();
    let mut gpu_seen = false;

    groom_list(
        &request.experiment.pythonenv,
        has_gpu,
        &mut gpu_seen,
        &mut out,
        ListKind::General,
    );
    groom_list(
        &request.config.pip,
        has_gpu,
        &mut gpu_seen,
        &mut out,
        ListKind::Configured,
    );
    out
}

enum ListKind {
    General,
    Configured,
}

fn groom_list(
    packages: &[String],
    has_gpu: bool,
    gpu_seen: &mut bool,
    out: &mut GroomedPackages,
    kind: ListKind,
) {
    for pkg in packages {
        if pkg.starts_with("studioml==") {
            out.studio_pip = Some(pkg.clone());
            continue;
        }
        if pkg.starts_with("pkg-resources") {
            continue;
        }
        if pkg.starts_with("tensorflow_gpu") {
            *gpu_seen = true;
        }

        let mut pkg = pkg.clone();
        if has_gpu && !*gpu_seen && (pkg == "tensorflow" || pkg.starts_with("tensorflow==")) {
            let rewritten = match pkg.split_once("==") {
                Some((_, version)) => {
                    out.tf_version = Some(version.to_string());
                    format!("tensorflow_gpu=={version}")
                }
                None => "tensorflow_gpu".to_string(),
            };
            pkg = rewritten;
        }

        match kind {
            ListKind::General => out.general.push(pkg),
            ListKind::Configured => out.configured.push(pkg),
        }
    }
}

/// A local studioml distribution staged under `workspace/dist` overrides any
/// version the package lists asked for.
fn local_studio_dist(workspace: &TaskWorkspace) -> Option<String> {
    let dist = workspace.workspace_dir().join("dist");
    let mut matches: Vec<String> = fs::read_dir(dist)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("studioml-") && n.ends_with(".tar.gz"))
                .unwrap_or(false)
        })
        .filter_map(|path| path.to_str().map(String::from))
        .collect();
    matches.sort();
    matches.pop()
}

fn status_echo(fragment: serde_json::Value) -> String {
    // Single quotes keep bash from touching the JSON.
    format!("echo '{}'", fragment)
}

/// Render the runner script for a task.
pub fn render_script(
    request: &Request,
    workspace: &TaskWorkspace,
    has_gpu: bool,
    host: &str,
) -> String {
    let mut packages = groom_packages(request, has_gpu);
    if let Some(dist) = local_studio_dist(workspace) {
        packages.studio_pip = Some(dist);
    }

    // Tensorflow 1.4 is the last cuda 8 build; everything newer wants 9.
    let cuda_dir = match &packages.tf_version {
        Some(v) if v.starts_with("1.4") => "/usr/local/cuda-8.0/lib64",
        _ => "/usr/local/cuda-9.0/lib64",
    };

    let mut lines: Vec<String> = vec![
        "#!/bin/bash -x".to_string(),
        "set -v".to_string(),
        "date".to_string(),
        "date -u".to_string(),
        "export LC_ALL=en_US.utf8".to_string(),
        format!(
            "export LD_LIBRARY_PATH={cuda_dir}:$LD_LIBRARY_PATH:/usr/local/cuda/lib64/:/usr/lib/x86_64-linux-gnu"
        ),
    ];

    for (key, value) in &request.config.env {
        lines.push(format!("export {key}=\"{value}\""));
    }

    lines.push(format!(
        "virtualenv -p `which python{}` .",
        request.experiment.python_ver
    ));
    lines.push("source bin/activate".to_string());
    lines.push("pip install pip --upgrade".to_string());

    if let Some(studio) = &packages.studio_pip {
        lines.push(format!("pip install -I {studio}"));
    }
    for pkg in &packages.general {
        lines.push(format!("pip install {pkg}"));
    }
    lines.push("pip install pyopenssl pipdeptree --upgrade".to_string());
    if !packages.configured.is_empty() {
        lines.push(format!("pip install {}", packages.configured.join(" ")));
    }

    lines.push(format!(
        "export STUDIOML_EXPERIMENT={}",
        request.experiment.key
    ));
    lines.push(format!(
        "export STUDIOML_HOME={}",
        workspace.dir().display()
    ));
    lines.push(format!("cd {}", workspace.workspace_dir().display()));
    lines.push("pip freeze".to_string());

    // Status fragments for the metadata scraper.
    lines.push(status_echo(json!({
        "studioml": {"experiment": {"key": request.experiment.key}}
    })));
    for (name, artifact) in &request.experiment.artifacts {
        let mut entry = serde_json::Map::new();
        entry.insert(
            name.clone(),
            serde_json::Value::String(artifact.qualified.clone()),
        );
        lines.push(status_echo(json!({"studioml": {"artifacts": entry}})));
    }
    lines.push(status_echo(json!({"studioml": {"host": host}})));
    // The dependency tree is only known once the installs above have run,
    // so it is compacted to one line inside the script rather than here.
    lines.push(
        concat!(
            "pipdeptree --json | python -c \"import json,sys; ",
            "print(json.dumps({'studioml': {'pipdeptree': json.load(sys.stdin)}}))\""
        )
        .to_string(),
    );
    lines.push(
        r#"echo "{\"studioml\": {\"start_time\": \"`date '+%FT%T.%N%:z'`\"}}""#.to_string(),
    );

    lines.push(format!(
        "python {} {}",
        request.experiment.filename,
        request.experiment.args.join(" ")
    ));
    lines.push("result=$?".to_string());
    lines.push(
        r#"echo "{\"studioml\": {\"stop_time\": \"`date '+%FT%T.%N%:z'`\"}}""#.to_string(),
    );
    lines.push("cd -".to_string());
    lines.push("deactivate".to_string());
    lines.push("date".to_string());
    lines.push("date -u".to_string());
    lines.push("exit $result".to_string());

    let mut script = lines.join("\n");
    script.push('\n');
    script
}

/// Render and install the script at the workspace's runner path, executable
/// by the runner only.
pub fn write_script(
    request: &Request,
    workspace: &TaskWorkspace,
    has_gpu: bool,
    host: &str,
) -> Result<std::path::PathBuf> {
    let path = workspace.script_path();
    let script = render_script(request, workspace, has_gpu, host);
    fs::write(&path, script).map_err(|e| RunnerError::io(&path, e))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o700))
        .map_err(|e| RunnerError::io(&path, e))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::Request;

    fn request_with_packages(pythonenv: &[&str], pip: &[&str]) -> Request {
        let mut request = Request::default();
        request.experiment.key = "exp-1".into();
        request.experiment.filename = "train.py".into();
        request.experiment.python_ver = 3;
        request.experiment.pythonenv = pythonenv.iter().map(|s| s.to_string()).collect();
        request.config.pip = pip.iter().map(|s| s.to_string()).collect();
        request
    }

    #[test]
    fn grooming_extracts_studioml_and_drops_pkg_resources() {
        let request = request_with_packages(
            &["numpy==1.26.0", "studioml==0.1.9", "pkg-resources==0.0.0"],
            &["pandas"],
        );
        let groomed = groom_packages(&request, false);
        assert_eq!(groomed.general, vec!["numpy==1.26.0"]);
        assert_eq!(groomed.configured, vec!["pandas"]);
        assert_eq!(groomed.studio_pip.as_deref(), Some("studioml==0.1.9"));
    }

    #[test]
    fn tensorflow_is_rewritten_for_gpu_grants() {
        let request = request_with_packages(&["tensorflow==1.8.0"], &[]);
        let groomed = groom_packages(&request, true);
        assert_eq!(groomed.general, vec!["tensorflow_gpu==1.8.0"]);
        assert_eq!(groomed.tf_version.as_deref(), Some("1.8.0"));

        // No rewrite without a GPU grant.
        let groomed = groom_packages(&request, false);
        assert_eq!(groomed.general, vec!["tensorflow==1.8.0"]);
    }

    #[test]
    fn pinned_gpu_build_is_left_alone() {
        let request = request_with_packages(&["tensorflow_gpu==1.8.0", "tensorflow==1.8.0"], &[]);
        let groomed = groom_packages(&request, true);
        assert_eq!(
            groomed.general,
            vec!["tensorflow_gpu==1.8.0", "tensorflow==1.8.0"]
        );
    }

    #[test]
    fn script_carries_env_interpreter_and_status_lines() {
        let root = tempfile::tempdir().unwrap();
        let ws = TaskWorkspace::create(root.path(), "exp-1", "node-a").unwrap();
        let mut request = request_with_packages(&["numpy"], &[]);
        request.experiment.args = vec!["--epochs".into(), "10".into()];
        request
            .config
            .env
            .insert("DATA_DIR".into(), "/data".into());

        let script = render_script(&request, &ws, false, "node-a");
        assert!(script.contains("virtualenv -p `which python3` ."));
        assert!(script.contains("export DATA_DIR=\"/data\""));
        assert!(script.contains("pip install numpy"));
        assert!(script.contains("pip install pyopenssl pipdeptree --upgrade"));
        assert!(script.contains("pipdeptree --json"));
        assert!(script.contains("'pipdeptree'"));
        assert!(script.contains("python train.py --epochs 10"));
        assert!(script.contains(r#"{"studioml":{"experiment":{"key":"exp-1"}}}"#));
        assert!(script.contains("exit $result"));
    }

    #[test]
    fn written_script_is_owner_executable() {
        let root = tempfile::tempdir().unwrap();
        let ws = TaskWorkspace::create(root.path(), "exp-1", "node-a").unwrap();
        let request = request_with_packages(&[], &[]);
        let path = write_script(&request, &ws, false, "node-a").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
