use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use concord_repository::{
    config::RepositoryConfig,
    provider::{GitCli, GitExecutor, GitInvocation, GitOutput, ProviderError},
    secret::{AccessScope, ProjectDirectory, Secret, SecretStore, DEFAULT_ORG_ID},
    RepositoryError, RepositoryManager, RepositoryRef,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::oneshot;
use uuid::Uuid;

const DEFAULT: &str = "classpath://default";
const NO_DEFINITION: &str = "classpath://no-definition";

struct Fixture {
    root: TempDir,
    config: RepositoryConfig,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let resources = root.path().join("resources");
        std::fs::create_dir_all(resources.join("default/flows")).unwrap();
        std::fs::write(resources.join("default/concord.yml"), "v1").unwrap();
        std::fs::write(resources.join("default/flows/.concord.yml"), "flows").unwrap();
        std::fs::create_dir_all(resources.join("no-definition")).unwrap();
        std::fs::write(resources.join("no-definition/README.md"), "nothing").unwrap();

        let mut config = RepositoryConfig::new(root.path().join("cache"));
        config.bundled_dir = resources;
        config.temp_dir = Some(root.path().join("tmp"));
        config.lock_timeout = Duration::from_millis(200);
        Self { root, config }
    }

    fn resource(&self, name: &str) -> PathBuf {
        self.root.path().join("resources").join(name)
    }

    fn temp_entries(&self) -> usize {
        std::fs::read_dir(self.root.path().join("tmp")).unwrap().count()
    }

    async fn manager(&self) -> RepositoryManager {
        RepositoryManager::builder(self.config.clone())
            .try_build()
            .await
            .unwrap()
    }
}

#[derive(Default)]
struct RecordingSecrets {
    requests: Mutex<Vec<(AccessScope, Uuid, String)>>,
}

#[async_trait]
impl SecretStore for RecordingSecrets {
    async fn get_secret(
        &self,
        scope: AccessScope,
        org_id: Uuid,
        name: &str,
    ) -> anyhow::Result<Option<Secret>> {
        self.requests
            .lock()
            .unwrap()
            .push((scope, org_id, name.to_owned()));
        match name {
            "known" => Ok(Some(Secret::Token("t0k3n".to_owned()))),
            "broken" => anyhow::bail!("secret store unavailable"),
            _ => Ok(None),
        }
    }
}

struct SingleProject {
    project_id: Uuid,
    org_id: Uuid,
}

#[async_trait]
impl ProjectDirectory for SingleProject {
    async fn org_id(&self, project_id: Uuid) -> anyhow::Result<Option<Uuid>> {
        Ok((project_id == self.project_id).then_some(self.org_id))
    }
}

/// Runs git for real and records the arguments of every run.
struct RecordingGit {
    git: GitCli,
    invocations: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl GitExecutor for RecordingGit {
    async fn run(&self, invocation: &GitInvocation) -> Result<GitOutput, ProviderError> {
        self.invocations
            .lock()
            .unwrap()
            .push(invocation.args.clone());
        self.git.run(invocation).await
    }
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn commit_definition(repository: &git2::Repository, content: &str) -> git2::Oid {
    let workdir = repository.workdir().unwrap().to_path_buf();
    std::fs::write(workdir.join("concord.yml"), content).unwrap();
    let mut index = repository.index().unwrap();
    index.add_path(Path::new("concord.yml")).unwrap();
    index.write().unwrap();
    let tree = repository.find_tree(index.write_tree().unwrap()).unwrap();
    let signature = git2::Signature::now("Concord", "concord@example.com").unwrap();
    let parent = repository
        .find_reference("refs/heads/main")
        .and_then(|reference| reference.peel_to_commit())
        .ok();
    let parents: Vec<_> = parent.iter().collect();
    let oid = repository
        .commit(
            Some("refs/heads/main"),
            &signature,
            &signature,
            content,
            &tree,
            &parents,
        )
        .unwrap();
    repository.set_head("refs/heads/main").unwrap();
    oid
}

#[tokio::test]
async fn fresh_checkout_is_reused() {
    let fixture = Fixture::new();
    let manager = fixture.manager().await;
    let reference = RepositoryRef::new(DEFAULT);

    let first = manager.fetch(&reference, None).await.unwrap();
    std::fs::write(fixture.resource("default/concord.yml"), "v2").unwrap();
    let second = manager.fetch(&reference, None).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.path(), manager.cache().directory(DEFAULT).unwrap());
    assert_eq!(read(&second.path().join("concord.yml")), "v1");
}

#[tokio::test]
async fn stale_checkout_is_fetched_again() {
    let mut fixture = Fixture::new();
    fixture.config.max_age = Duration::ZERO;
    let manager = fixture.manager().await;
    let reference = RepositoryRef::new(DEFAULT);

    let first = manager.fetch(&reference, None).await.unwrap();
    std::fs::write(fixture.resource("default/concord.yml"), "v2").unwrap();
    let second = manager.fetch(&reference, None).await.unwrap();

    assert_eq!(first.path(), second.path());
    assert_eq!(read(&second.path().join("concord.yml")), "v2");
}

#[tokio::test]
async fn stale_git_checkout_is_updated_in_place() {
    if !git_available() {
        eprintln!("git is not available, skipping");
        return;
    }
    let origin = tempfile::tempdir().unwrap();
    let repository = git2::Repository::init(origin.path()).unwrap();
    commit_definition(&repository, "v1");
    let url = format!("file://{}", origin.path().display());

    let mut fixture = Fixture::new();
    fixture.config.max_age = Duration::ZERO;
    let git = Arc::new(RecordingGit {
        git: GitCli::new("git"),
        invocations: Mutex::new(Vec::new()),
    });
    let manager = RepositoryManager::builder(fixture.config.clone())
        .git_executor(git.clone())
        .try_build()
        .await
        .unwrap();
    let reference = RepositoryRef::new(url.as_str());

    let first = manager.fetch(&reference, None).await.unwrap();
    git.invocations.lock().unwrap().clear();
    let head = commit_definition(&repository, "v2");
    let second = manager.fetch(&reference, None).await.unwrap();

    let invocations = git.invocations.lock().unwrap().clone();
    assert!(invocations.iter().all(|args| args[0] != "init"), "{invocations:?}");
    assert_eq!(invocations[0][..2].to_vec(), vec!["remote", "set-url"]);
    assert_eq!(first.path(), second.path());
    assert_eq!(second.revision(), Some(head.to_string().as_str()));
    assert_eq!(read(&second.path().join("concord.yml")), "v2");
}

#[tokio::test]
async fn failed_fetch_keeps_cached_checkout() {
    let mut fixture = Fixture::new();
    fixture.config.max_age = Duration::ZERO;
    let manager = fixture.manager().await;
    let reference = RepositoryRef::new(DEFAULT);

    let cached = manager.fetch(&reference, None).await.unwrap();
    std::fs::remove_dir_all(fixture.resource("default")).unwrap();

    let error = manager.fetch(&reference, None).await.unwrap_err();
    assert!(matches!(error, RepositoryError::Fetch { .. }), "{error}");
    assert_eq!(read(&cached.path().join("concord.yml")), "v1");
}

#[tokio::test]
async fn unsupported_url_has_no_provider() {
    let fixture = Fixture::new();
    let manager = fixture.manager().await;

    let error = manager
        .fetch(&RepositoryRef::new(""), None)
        .await
        .unwrap_err();
    assert!(matches!(error, RepositoryError::NoProvider { .. }), "{error}");
}

#[tokio::test]
async fn test_connection_removes_its_directory() {
    let fixture = Fixture::new();
    let manager = fixture.manager().await;
    let project_id = Uuid::new_v4();

    manager
        .test_connection(None, project_id, &RepositoryRef::new(DEFAULT))
        .await
        .unwrap();
    assert_eq!(fixture.temp_entries(), 0);

    manager
        .test_connection(None, project_id, &RepositoryRef::new("classpath://missing"))
        .await
        .unwrap_err();
    assert_eq!(fixture.temp_entries(), 0);

    manager
        .test_connection(None, project_id, &RepositoryRef::new(NO_DEFINITION))
        .await
        .unwrap_err();
    assert_eq!(fixture.temp_entries(), 0);
}

#[tokio::test]
async fn test_connection_requires_a_definition() {
    let fixture = Fixture::new();
    let manager = fixture.manager().await;
    let project_id = Uuid::new_v4();

    let error = manager
        .test_connection(None, project_id, &RepositoryRef::new(NO_DEFINITION))
        .await
        .unwrap_err();
    assert!(
        matches!(error, RepositoryError::InvalidRepositoryPath { .. }),
        "{error}"
    );

    manager
        .test_connection(
            None,
            project_id,
            &RepositoryRef::new(DEFAULT).with_path("flows"),
        )
        .await
        .unwrap();

    let mut config = fixture.config.clone();
    config.validate_definition = false;
    config.cache_dir = fixture.root.path().join("other-cache");
    config.cache_info_dir = config.cache_dir.join(".info");
    let lenient = RepositoryManager::builder(config).try_build().await.unwrap();
    lenient
        .test_connection(None, project_id, &RepositoryRef::new(NO_DEFINITION))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_connection_does_not_touch_the_cache() {
    let fixture = Fixture::new();
    let manager = fixture.manager().await;

    manager
        .test_connection(None, Uuid::new_v4(), &RepositoryRef::new(DEFAULT))
        .await
        .unwrap();
    assert_eq!(manager.cache().entry(DEFAULT).unwrap(), None);
}

#[tokio::test]
async fn missing_secret_is_reported() {
    let fixture = Fixture::new();
    let manager = RepositoryManager::builder(fixture.config.clone())
        .secret_store(Arc::new(RecordingSecrets::default()))
        .try_build()
        .await
        .unwrap();
    let reference = RepositoryRef::new(DEFAULT).with_secret_name("unknown");

    let error = manager
        .test_connection(None, Uuid::new_v4(), &reference)
        .await
        .unwrap_err();
    assert!(
        matches!(&error, RepositoryError::SecretNotFound { name, .. } if name == "unknown"),
        "{error}"
    );

    let error = manager
        .fetch_for_project(Uuid::new_v4(), &reference)
        .await
        .unwrap_err();
    assert!(matches!(error, RepositoryError::SecretNotFound { .. }), "{error}");

    let error = manager
        .fetch_for_project(
            Uuid::new_v4(),
            &RepositoryRef::new(DEFAULT).with_secret_name("broken"),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(error, RepositoryError::SecretResolution { .. }),
        "{error}"
    );
}

#[tokio::test]
async fn organization_falls_back_to_default() {
    let fixture = Fixture::new();
    let secrets = Arc::new(RecordingSecrets::default());
    let known_project = Uuid::new_v4();
    let project_org = Uuid::new_v4();
    let explicit_org = Uuid::new_v4();
    let manager = RepositoryManager::builder(fixture.config.clone())
        .secret_store(secrets.clone())
        .project_directory(Arc::new(SingleProject {
            project_id: known_project,
            org_id: project_org,
        }))
        .try_build()
        .await
        .unwrap();
    let reference = RepositoryRef::new(DEFAULT).with_secret_name("known");
    let unknown_project = Uuid::new_v4();

    manager
        .test_connection(None, unknown_project, &reference)
        .await
        .unwrap();
    manager
        .test_connection(None, known_project, &reference)
        .await
        .unwrap();
    manager
        .test_connection(Some(explicit_org), known_project, &reference)
        .await
        .unwrap();
    manager
        .fetch_for_project(unknown_project, &reference)
        .await
        .unwrap();

    let requests = secrets.requests.lock().unwrap().clone();
    assert_eq!(
        requests,
        vec![
            (
                AccessScope::Project(unknown_project),
                DEFAULT_ORG_ID,
                "known".to_owned()
            ),
            (
                AccessScope::Project(known_project),
                project_org,
                "known".to_owned()
            ),
            (
                AccessScope::Project(known_project),
                explicit_org,
                "known".to_owned()
            ),
            (
                AccessScope::Project(unknown_project),
                DEFAULT_ORG_ID,
                "known".to_owned()
            ),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_url_is_serialized() {
    let mut fixture = Fixture::new();
    fixture.config.lock_timeout = Duration::from_secs(30);
    let manager = Arc::new(fixture.manager().await);
    let active = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let manager = Arc::clone(&manager);
        let active = Arc::clone(&active);
        let completed = Arc::clone(&completed);
        tasks.push(tokio::spawn(async move {
            manager
                .with_lock(DEFAULT, || async {
                    assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                    let repository = manager.fetch(&RepositoryRef::new(DEFAULT), None).await;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                    repository
                })
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(completed.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn lock_wait_is_bounded() {
    let fixture = Fixture::new();
    let manager = Arc::new(fixture.manager().await);
    let (held_tx, held_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let holder = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .with_lock(DEFAULT, move || async move {
                    held_tx.send(()).unwrap();
                    release_rx.await.unwrap();
                    Ok(())
                })
                .await
        })
    };
    held_rx.await.unwrap();

    let error = manager
        .with_lock(DEFAULT, || async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(error, RepositoryError::LockTimeout { .. }), "{error}");

    let other: Result<u8, RepositoryError> = manager
        .with_lock("https://example.com/org/other.git", || async { Ok(1) })
        .await;
    assert_eq!(other.unwrap(), 1);

    release_tx.send(()).unwrap();
    holder.await.unwrap().unwrap();
    manager
        .with_lock(DEFAULT, || async { Ok(()) })
        .await
        .unwrap();
}

#[tokio::test]
async fn invalidate_and_cleanup() {
    let mut fixture = Fixture::new();
    fixture.config.max_age = Duration::ZERO;
    let manager = fixture.manager().await;

    let repository = manager
        .fetch(&RepositoryRef::new(DEFAULT), None)
        .await
        .unwrap();
    assert!(manager.invalidate(DEFAULT).await.unwrap());
    assert!(!repository.path().exists());

    manager
        .fetch(&RepositoryRef::new(DEFAULT), None)
        .await
        .unwrap();
    let report = manager.cleanup().await.unwrap();
    assert_eq!(report.evicted, vec![DEFAULT.to_owned()]);
    assert_eq!(manager.cache().entry(DEFAULT).unwrap(), None);
}
