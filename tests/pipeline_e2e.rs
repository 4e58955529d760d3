//! End-to-end pipeline runs against stub `spack` and `singularity` executables.
//!
//! The stubs are shell scripts written into a temporary directory, so these
//! tests only run on unix.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use envforge::config::{RegistryConfig, Settings};
use envforge::logging::ContextLogger;
use envforge::pipeline::{EnvironmentModel, PipelineCoordinator, RunDescriptor, RunState, StageRunner};
use envforge::registry::RegistryVersionResolver;
use envforge::scheduler::{MemoryQueue, WorkerPool, WorkerPoolConfig};
use envforge::storage::ArtifactStore;
use tempfile::TempDir;

const SPACK_STUB: &str = r#"#!/bin/sh
set -e
echo "$*" >> "$(dirname "$0")/spack.calls"
if [ "$1" = "env" ] && [ "$2" = "create" ]; then
  printf 'spack:\n  view: true\n' > "$5/spack.yaml"
  exit 0
fi
if [ "$1" = "--env" ]; then
  dir="$2"; cmd="$3"; shift 3
  case "$cmd" in
    add)
      echo "  specs:" >> "$dir/spack.yaml"
      for p in "$@"; do echo "  - $p" >> "$dir/spack.yaml"; done
      ;;
    containerize)
      os=$(grep -E '^ +os:' "$dir/spack.yaml" | head -n 1 | sed -E "s/^ +os: *//; s/[\"']//g")
      printf 'Bootstrap: docker\nFrom: %s\nStage: final\n\n%%post\n  echo ok\n' "$os"
      ;;
  esac
  exit 0
fi
exit 1
"#;

fn singularity_stub(calls: &Path) -> String {
    format!(
        r#"#!/bin/sh
echo "$*" >> "{calls}"
if [ "$1" = "build" ]; then
  for a in "$@"; do
    case "$a" in *.sif) : > "$a" ;; esac
  done
fi
if [ "$1" = "remote" ] && [ "$2" = "login" ]; then
  cat > /dev/null
fi
exit 0
"#,
        calls = calls.display()
    )
}

fn write_script(path: &Path, content: &str) {
    std::fs::write(path, content).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

struct Harness {
    dir: TempDir,
    calls: PathBuf,
    settings: Arc<Settings>,
}

impl Harness {
    /// Sets up stubs and settings; `with_singularity = false` points the
    /// container builder at a missing binary.
    fn new(overrides: &str, with_singularity: bool) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let calls = root.join("singularity.calls");

        let spack = root.join("spack");
        write_script(&spack, SPACK_STUB);
        let singularity = root.join("singularity");
        if with_singularity {
            write_script(&singularity, &singularity_stub(&calls));
        }

        let templates = root.join("templates");
        std::fs::create_dir_all(&templates).unwrap();
        std::fs::write(
            templates.join("generic"),
            "#%Module1.0\n## {{ description }}\nset image {{ build.image }}\n",
        )
        .unwrap();

        let mut settings = Settings::from_yaml_layers(Some(overrides)).unwrap();
        settings.environments.path = root.join("environments");
        settings.artifacts.path = root.join("artifacts");
        settings.spack.command = spack.display().to_string();
        settings.container.command = singularity.display().to_string();
        settings.modules.templates.path = templates;
        settings.artifacts.registries.insert(
            "default".to_string(),
            RegistryConfig {
                url: "http://127.0.0.1:1/envforge".to_string(),
                username: "robot".to_string(),
                password: "s3cret".to_string(),
            },
        );

        Self {
            dir,
            calls,
            settings: Arc::new(settings),
        }
    }

    /// Starts a local worker pool and a coordinator feeding it.
    fn start(&self) -> (PipelineCoordinator, WorkerPool) {
        let queue = Arc::new(MemoryQueue::new());
        let logger = Arc::new(ContextLogger::new(Arc::clone(&self.settings)));
        let runner = StageRunner::new(
            Arc::clone(&self.settings),
            Arc::clone(&logger),
            Arc::new(ArtifactStore::new(&self.settings.artifacts.path)),
            RegistryVersionResolver::http(),
        );
        let mut pool = WorkerPool::new(
            WorkerPoolConfig::new(2).with_poll_interval(Duration::from_millis(20)),
            queue.clone(),
            Arc::new(runner),
        );
        pool.start().unwrap();

        let coordinator = PipelineCoordinator::new(Arc::clone(&self.settings), queue, logger);
        (coordinator, pool)
    }

    async fn run(&self, name: &str, packages: &[&str]) -> RunDescriptor {
        let (coordinator, mut pool) = self.start();
        let descriptor = coordinator.run(name, model(packages)).await.unwrap();
        pool.shutdown().await.unwrap();
        descriptor
    }

    fn workspace(&self, descriptor: &RunDescriptor) -> PathBuf {
        self.settings.environments.path.join(descriptor.id.to_string())
    }

    fn calls(&self) -> String {
        std::fs::read_to_string(&self.calls).unwrap_or_default()
    }

    fn spack_calls(&self) -> String {
        std::fs::read_to_string(self.dir.path().join("spack.calls")).unwrap_or_default()
    }
}

fn model(packages: &[&str]) -> EnvironmentModel {
    EnvironmentModel::new("demo environment", packages.iter().copied())
}

#[tokio::test]
async fn test_pipeline_completes_and_publishes() {
    let harness = Harness::new(
        "artifacts:\n  registries:\n    mirror:\n      url: oras://mirror.example.org/envs\n",
        true,
    );
    let descriptor = harness.run("users/alice/demo", &["zlib"]).await;

    assert_eq!(descriptor.state, RunState::Completed, "{:?}", descriptor.failure);
    assert_eq!(descriptor.image_version.as_deref(), Some("1.0"));
    assert_eq!(descriptor.completed_stages.len(), 6);
    assert_eq!(
        serde_json::to_value(descriptor.status()).unwrap()["state"]["type"],
        "COMPLETED"
    );

    let ws = harness.workspace(&descriptor);
    for file in [
        "spack.yaml",
        "singularity-build.def",
        "singularity-final.def",
        "module",
        "image.sif",
    ] {
        assert!(ws.join(file).exists(), "missing {}", file);
    }
    let log = std::fs::read_to_string(ws.join("build.log")).unwrap();
    assert!(log.contains("assuming no tags"), "fallback not logged:\n{}", log);
    assert!(!harness.spack_calls().contains("concretize"));

    let manifest = std::fs::read_to_string(ws.join("spack.yaml")).unwrap();
    assert!(manifest.contains("- zlib"));
    assert!(manifest.contains("template: envforge/singularity-final.def"));
    assert!(manifest.contains("unify: true"));

    let build_def = std::fs::read_to_string(ws.join("singularity-build.def")).unwrap();
    assert!(build_def.contains("buildcache push --allow-root --force local zlib"));

    let final_def = std::fs::read_to_string(ws.join("singularity-final.def")).unwrap();
    assert!(final_def.contains("From: ubuntu:22.04"));

    let module = std::fs::read_to_string(ws.join("module")).unwrap();
    assert!(module.contains("## demo environment"));
    assert!(module.contains("set image http://127.0.0.1:1/envforge/users-alice/demo:1.0"));

    let calls = harness.calls();
    assert!(calls.contains("build --force --fakeroot --bind"));
    assert!(calls.contains("push"));
    assert!(calls.contains("http://127.0.0.1:1/envforge/users-alice/demo:1.0"));
    assert!(calls.contains("oras://mirror.example.org/envs/users-alice/demo:1.0"));
    assert_eq!(calls.matches("remote login").count(), 2);
    assert_eq!(calls.matches("remote logout").count(), 2);
    assert!(!calls.contains("s3cret"), "secret leaked into arguments");

    let store = ArtifactStore::new(&harness.settings.artifacts.path);
    let stored = store.list("users/alice/demo").await.unwrap();
    let files: Vec<&str> = stored.keys().map(String::as_str).collect();
    assert_eq!(
        files,
        ["module", "singularity-build.def", "singularity-final.def", "spack.yaml"]
    );
}

#[tokio::test]
async fn test_missing_container_builder_fails_without_push() {
    let harness = Harness::new("{}", false);
    let descriptor = harness.run("demo", &["zlib"]).await;

    assert_eq!(descriptor.state, RunState::Failed);
    let failure = descriptor.failure.clone().unwrap();
    assert_eq!(failure.stage.as_deref(), Some("containerize-build"));
    assert_eq!(descriptor.completed_stages, ["stage", "create-manifest"]);
    assert!(descriptor.image_version.is_none());
    assert!(harness.calls().is_empty());

    let ws = harness.workspace(&descriptor);
    assert!(ws.join("singularity-build.def").exists());
    assert!(!ws.join("module").exists());
    let log = std::fs::read_to_string(ws.join("build.log")).unwrap();
    assert!(log.contains("containerize-build"));
}

#[tokio::test]
async fn test_final_stage_swaps_base_image_for_matching_package() {
    let harness = Harness::new(
        "container:\n  singularity:\n    patch:\n      - pattern: special-pkg\n        final:\n          image: special-image\n",
        true,
    );
    let descriptor = harness.run("demo", &["zlib", "special-pkg"]).await;
    assert_eq!(descriptor.state, RunState::Completed, "{:?}", descriptor.failure);

    let ws = harness.workspace(&descriptor);
    let final_def = std::fs::read_to_string(ws.join("singularity-final.def")).unwrap();
    assert!(final_def.contains("From: special-image\n"));
    assert!(!final_def.contains("ubuntu:22.04"));

    let build_def = std::fs::read_to_string(ws.join("singularity-build.def")).unwrap();
    assert!(build_def.contains("From: ubuntu:22.04"));
}

#[tokio::test]
async fn test_concretize_runs_after_manifest_patch_when_enabled() {
    let harness = Harness::new("spack:\n  concretize: true\n", true);
    let descriptor = harness.run("demo", &["zlib"]).await;
    assert_eq!(descriptor.state, RunState::Completed, "{:?}", descriptor.failure);

    let calls = harness.spack_calls();
    let add = calls.find(" add zlib").expect("add recorded");
    let concretize = calls.find(" concretize").expect("concretize recorded");
    let containerize = calls.find(" containerize").expect("containerize recorded");
    assert!(add < concretize && concretize < containerize, "{}", calls);
}

#[tokio::test]
async fn test_concurrent_runs_with_same_name_get_own_workspaces() {
    let harness = Harness::new("{}", true);
    let (coordinator, mut pool) = harness.start();

    let (first, second) = tokio::join!(
        coordinator.run("demo", model(&["zlib"])),
        coordinator.run("demo", model(&["xz"])),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    pool.shutdown().await.unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(first.state, RunState::Completed, "{:?}", first.failure);
    assert_eq!(second.state, RunState::Completed, "{:?}", second.failure);

    let (ws1, ws2) = (harness.workspace(&first), harness.workspace(&second));
    assert_ne!(ws1, ws2);
    for (ws, package) in [(&ws1, "zlib"), (&ws2, "xz")] {
        let manifest = std::fs::read_to_string(ws.join("spack.yaml")).unwrap();
        assert!(manifest.contains(&format!("- {}", package)));
        assert!(std::fs::metadata(ws.join("build.log")).unwrap().len() > 0);
    }

    let log1 = std::fs::read_to_string(ws1.join("build.log")).unwrap();
    assert!(log1.contains(&first.id.to_string()));
    assert!(!log1.contains(&second.id.to_string()));
}
