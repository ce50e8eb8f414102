use std::error::Error;

use log::info;
use uuid::Uuid;

use crate::{model::RepositoryRef, RepositoryManager};

/// Handler to fetch command
/// Fetches under the repository lock and prints the checkout location
pub async fn do_fetch(
    manager: &RepositoryManager,
    project_id: Uuid,
    reference: &RepositoryRef,
) -> Result<(), Box<dyn Error>> {
    let repository = manager
        .with_lock(reference.url(), || {
            manager.fetch_for_project(project_id, reference)
        })
        .await?;

    info!(
        "Fetched {} at revision {}",
        reference,
        repository.revision().unwrap_or("-")
    );
    println!("{}", repository.path().display());
    Ok(())
}

/// Handler to test-connection command
pub async fn do_test_connection(
    manager: &RepositoryManager,
    org_id: Option<Uuid>,
    project_id: Uuid,
    reference: &RepositoryRef,
) -> Result<(), Box<dyn Error>> {
    manager.test_connection(org_id, project_id, reference).await?;
    println!("OK");
    Ok(())
}

/// Handler to invalidate command
pub async fn do_invalidate(manager: &RepositoryManager, url: &str) -> Result<(), Box<dyn Error>> {
    if !manager.invalidate(url).await? {
        info!("{} is not cached, nothing to do", url);
    }
    Ok(())
}

/// Handler to cleanup command
pub async fn do_cleanup(manager: &RepositoryManager) -> Result<(), Box<dyn Error>> {
    let report = manager.cleanup().await?;
    for url in &report.evicted {
        println!("{url}");
    }
    if report.skipped_locked > 0 {
        info!(
            "Skipped {} repositories that are in use",
            report.skipped_locked
        );
    }
    Ok(())
}
