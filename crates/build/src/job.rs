//! The build Job manifest: an init container fetches the source into a shared
//! workspace, the main container builds and pushes the image.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, KeyToPath, PodSpec, PodTemplateSpec, SecretVolumeSource, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use keel_core::config::BuildSettings;
use keel_core::{GitSource, ResourceNames, LABEL_MANAGED_BY, LABEL_ROLE, LABEL_SERVICE, MANAGED_BY_KEEL};

use crate::image::is_plain_registry;

pub const FETCH_CONTAINER: &str = "fetch-source";
pub const BUILD_CONTAINER: &str = "build";
/// Exit code of the fetch step when the build descriptor is missing.
pub const MISSING_DESCRIPTOR_EXIT: i32 = 3;

const WORKSPACE_VOLUME: &str = "workspace";
const WORKSPACE_PATH: &str = "/workspace";
const DOCKER_CONFIG_VOLUME: &str = "docker-config";
const DOCKER_CONFIG_PATH: &str = "/kaniko/.docker";

const FETCH_SCRIPT: &str = r#"set -eu
git clone --depth 1 --single-branch --branch "$GIT_BRANCH" "$GIT_URL" /workspace
cd /workspace
if [ -n "${GIT_COMMIT:-}" ]; then
  git fetch --depth 1 origin "$GIT_COMMIT"
  git checkout --quiet FETCH_HEAD
fi
if [ ! -f "$BUILD_DESCRIPTOR" ]; then
  echo "build descriptor $BUILD_DESCRIPTOR not found" >&2
  exit 3
fi
"#;

/// Everything a single build job is made from.
pub struct JobPlan<'a> {
    pub namespace: &'a str,
    pub job_name: &'a str,
    pub names: &'a ResourceNames,
    pub source: &'a GitSource,
    pub commit: Option<&'a str>,
    pub build_args: &'a BTreeMap<String, String>,
    pub image: &'a str,
    pub registry: &'a str,
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar { name: name.to_string(), value: Some(value.to_string()), value_from: None }
}

/// Build job labels. Deliberately without the workload selector label so build
/// pods never count as pods of the running service.
fn job_labels(names: &ResourceNames) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY_KEEL.to_string()),
        (LABEL_SERVICE.to_string(), names.base.clone()),
        (LABEL_ROLE.to_string(), "build".to_string()),
    ])
}

pub fn builder_args(plan: &JobPlan<'_>) -> Vec<String> {
    let descriptor = plan.source.build_descriptor.trim_start_matches("./");
    let mut args = vec![
        format!("--context=dir://{}", WORKSPACE_PATH),
        format!("--dockerfile={}/{}", WORKSPACE_PATH, descriptor),
        format!("--destination={}", plan.image),
    ];
    args.extend(plan.build_args.iter().map(|(k, v)| format!("--build-arg={}={}", k, v)));
    if is_plain_registry(plan.registry) {
        args.push("--insecure".to_string());
        args.push("--skip-tls-verify".to_string());
    }
    args
}

pub fn build_job(plan: &JobPlan<'_>, settings: &BuildSettings) -> Job {
    let workspace = VolumeMount { name: WORKSPACE_VOLUME.to_string(), mount_path: WORKSPACE_PATH.to_string(), ..Default::default() };

    let fetch = Container {
        name: FETCH_CONTAINER.to_string(),
        image: Some(settings.git_image.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), FETCH_SCRIPT.to_string()]),
        env: Some(vec![
            env("GIT_URL", &plan.source.url),
            env("GIT_BRANCH", &plan.source.branch),
            env("GIT_COMMIT", plan.commit.unwrap_or_default()),
            env("BUILD_DESCRIPTOR", &plan.source.build_descriptor),
        ]),
        volume_mounts: Some(vec![workspace.clone()]),
        ..Default::default()
    };

    let mut build_mounts = vec![workspace];
    let mut volumes = vec![Volume {
        name: WORKSPACE_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }];
    if let Some(secret) = &settings.registry_secret {
        build_mounts.push(VolumeMount {
            name: DOCKER_CONFIG_VOLUME.to_string(),
            mount_path: DOCKER_CONFIG_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        volumes.push(Volume {
            name: DOCKER_CONFIG_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.clone()),
                items: Some(vec![KeyToPath {
                    key: ".dockerconfigjson".to_string(),
                    path: "config.json".to_string(),
                    mode: None,
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let build = Container {
        name: BUILD_CONTAINER.to_string(),
        image: Some(settings.builder_image.clone()),
        args: Some(builder_args(plan)),
        volume_mounts: Some(build_mounts),
        ..Default::default()
    };

    let labels = job_labels(plan.names);
    Job {
        metadata: ObjectMeta {
            name: Some(plan.job_name.to_string()),
            namespace: Some(plan.namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(settings.job_ttl.as_secs().min(i32::MAX as u64) as i32),
            active_deadline_seconds: Some(settings.deadline.as_secs().min(i64::MAX as u64) as i64),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    init_containers: Some(vec![fetch]),
                    containers: vec![build],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ServiceId;

    fn source() -> GitSource {
        GitSource {
            url: "https://git.example.com/acme/app.git".into(),
            branch: "main".into(),
            commit: None,
            build_descriptor: "Dockerfile".into(),
        }
    }

    #[test]
    fn job_is_single_shot_with_deadline_and_ttl() {
        let names = ResourceNames::for_service(&ServiceId::new("svc-1"));
        let src = source();
        let args = BTreeMap::from([("B".to_string(), "2".to_string()), ("A".to_string(), "1".to_string())]);
        let plan = JobPlan {
            namespace: "acme",
            job_name: "build-svc-1-abc",
            names: &names,
            source: &src,
            commit: Some("abc"),
            build_args: &args,
            image: "registry.keel-system.svc:5000/svc-1:abc",
            registry: "registry.keel-system.svc:5000",
        };
        let job = build_job(&plan, &BuildSettings::default());
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.active_deadline_seconds, Some(900));
        assert_eq!(spec.ttl_seconds_after_finished, Some(600));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));

        let init = &pod.init_containers.unwrap()[0];
        assert_eq!(init.name, FETCH_CONTAINER);
        let commit = init.env.as_ref().unwrap().iter().find(|e| e.name == "GIT_COMMIT").unwrap();
        assert_eq!(commit.value.as_deref(), Some("abc"));

        let build_args = pod.containers[0].args.clone().unwrap();
        assert_eq!(
            build_args,
            vec![
                "--context=dir:///workspace",
                "--dockerfile=/workspace/Dockerfile",
                "--destination=registry.keel-system.svc:5000/svc-1:abc",
                "--build-arg=A=1",
                "--build-arg=B=2",
                "--insecure",
                "--skip-tls-verify",
            ]
        );
    }

    #[test]
    fn tls_registry_and_push_credentials() {
        let names = ResourceNames::for_service(&ServiceId::new("svc-1"));
        let src = source();
        let args = BTreeMap::new();
        let plan = JobPlan {
            namespace: "acme",
            job_name: "build-svc-1-latest",
            names: &names,
            source: &src,
            commit: None,
            build_args: &args,
            image: "ghcr.io/acme/svc-1:latest",
            registry: "ghcr.io/acme",
        };
        let settings = BuildSettings { registry_secret: Some("push-creds".into()), ..Default::default() };
        let job = build_job(&plan, &settings);
        let pod = job.spec.unwrap().template.spec.unwrap();
        let build = &pod.containers[0];
        assert!(!build.args.as_ref().unwrap().iter().any(|a| a == "--insecure"));
        assert!(build.volume_mounts.as_ref().unwrap().iter().any(|m| m.mount_path == DOCKER_CONFIG_PATH));
        assert_eq!(pod.volumes.unwrap().len(), 2);
    }

    #[test]
    fn build_pods_do_not_carry_the_workload_selector() {
        let names = ResourceNames::for_service(&ServiceId::new("svc-1"));
        assert!(!job_labels(&names).contains_key(keel_core::LABEL_NAME));
    }
}
