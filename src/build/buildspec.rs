//! Build specification rendering
//!
//! The remote build runs three phases: registry login plus a pull of the
//! previous `latest` image for layer caching, a buildx build for the
//! runtime's platform, then a push of the content tag and `latest`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Build spec file written into the source root before bundling
pub const BUILDSPEC_FILE: &str = "buildspec.agent-launch.yml";

/// Target platform of the managed runtime
pub const TARGET_PLATFORM: &str = "linux/arm64";

/// Environment variables every build receives
pub const BUILD_ENV_VARS: &[&str] = &[
    "AWS_ACCOUNT_ID",
    "AWS_DEFAULT_REGION",
    "IMAGE_REPO_NAME",
    "REPOSITORY_URI",
    "IMAGE_TAG",
    "STACK_ID",
];

/// Rendering options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpecOptions {
    /// Dockerfile path relative to the source root
    pub dockerfile: String,
    /// Reuse layers of the previous `latest` image
    pub use_layer_cache: bool,
}

impl Default for BuildSpecOptions {
    fn default() -> Self {
        Self {
            dockerfile: "Dockerfile".to_string(),
            use_layer_cache: true,
        }
    }
}

/// Commands of one build phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseCommands {
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSpecPhases {
    pub pre_build: PhaseCommands,
    pub build: PhaseCommands,
    pub post_build: PhaseCommands,
}

/// Build spec document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub version: f64,
    pub phases: BuildSpecPhases,
}

impl BuildSpec {
    pub fn new(options: &BuildSpecOptions) -> Self {
        let registry = "$AWS_ACCOUNT_ID.dkr.ecr.$AWS_DEFAULT_REGION.amazonaws.com";

        let mut pre_build = vec![
            "echo Logging in to the image registry".to_string(),
            format!(
                "aws ecr get-login-password --region $AWS_DEFAULT_REGION | docker login --username AWS --password-stdin {}",
                registry
            ),
        ];
        let mut build_cmd = format!(
            "docker buildx build --platform {} --load -f {}",
            TARGET_PLATFORM, options.dockerfile
        );
        if options.use_layer_cache {
            pre_build.push("docker pull $REPOSITORY_URI:latest || true".to_string());
            build_cmd.push_str(" --cache-from $REPOSITORY_URI:latest");
        }
        build_cmd.push_str(" -t $REPOSITORY_URI:$IMAGE_TAG -t $REPOSITORY_URI:latest .");

        let build = vec![
            "echo Building $IMAGE_REPO_NAME for $STACK_ID".to_string(),
            "docker buildx create --use --name agent-launch || docker buildx use agent-launch".to_string(),
            build_cmd,
        ];
        let post_build = vec![
            "docker push $REPOSITORY_URI:$IMAGE_TAG".to_string(),
            "docker push $REPOSITORY_URI:latest".to_string(),
            "echo Pushed $REPOSITORY_URI:$IMAGE_TAG".to_string(),
        ];

        Self {
            version: 0.2,
            phases: BuildSpecPhases {
                pre_build: PhaseCommands { commands: pre_build },
                build: PhaseCommands { commands: build },
                post_build: PhaseCommands { commands: post_build },
            },
        }
    }

    /// Every command, in execution order
    pub fn commands(&self) -> impl Iterator<Item = &str> {
        let phases = &self.phases;
        [&phases.pre_build, &phases.build, &phases.post_build]
            .into_iter()
            .flat_map(|p| p.commands.iter().map(String::as_str))
    }
}

/// Render the build spec YAML
pub fn render_buildspec(options: &BuildSpecOptions) -> Result<String, serde_yaml_bw::Error> {
    serde_yaml_bw::to_string(&BuildSpec::new(options))
}

/// Write a fresh build spec into `root`, replacing any previous one
pub fn write_buildspec(root: &Path, options: &BuildSpecOptions) -> io::Result<PathBuf> {
    let yaml = render_buildspec(options)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("YAML error: {}", e)))?;
    let path = root.join(BUILDSPEC_FILE);
    let temp_path = path.with_extension("yml.tmp");
    fs::write(&temp_path, yaml)?;
    fs::rename(&temp_path, &path)?;
    Ok(path)
}
