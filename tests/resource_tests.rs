//! Tests for loading resource pools from layered sources

use pipeline_resilience::error_recovery::ResourcePoolRegistry;
use pipeline_resilience::{
    DependencyId, ErrorClassifier, ErrorKind, ExhaustionPolicy, ResilienceError, ResourceLoader,
    ResourceSource,
};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn file_with(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{content}").unwrap();
    file
}

fn model_api() -> DependencyId {
    DependencyId::new("model-api")
}

#[tokio::test]
#[serial]
async fn test_sources_are_ranked_by_priority() {
    let dedicated = file_with("# primary project keys\nkey-dedicated-1\n\nkey-dedicated-2\n");
    let shared = file_with(
        "video-platform: key-video\nmodel-api: key-shared\n# comment: ignored\nkey-any\n",
    );

    let loader = ResourceLoader::new(model_api())
        .source(ResourceSource::Explicit(vec!["key-explicit".to_string()]))
        .source(ResourceSource::Dedicated(dedicated.path().to_path_buf()))
        .source(ResourceSource::Shared(shared.path().to_path_buf()))
        .source(ResourceSource::Environment("TEST_MODEL_API_KEYS".to_string()));

    let entries = temp_env::async_with_vars(
        [("TEST_MODEL_API_KEYS", Some("key-env-1, key-env-2"))],
        loader.load_entries(),
    )
    .await
    .unwrap();

    let values: Vec<_> = entries.iter().map(|e| e.value.as_str()).collect();
    assert_eq!(
        values,
        vec![
            "key-explicit",
            "key-dedicated-1",
            "key-dedicated-2",
            "key-shared",
            "key-any",
            "key-env-1",
            "key-env-2",
        ]
    );
    let ranks: Vec<_> = entries.iter().map(|e| e.priority_rank).collect();
    assert_eq!(ranks, (0..7).collect::<Vec<u32>>());
    assert_eq!(entries[0].source_label, "explicit");
    assert_eq!(entries[6].source_label, "env:TEST_MODEL_API_KEYS");
}

#[tokio::test]
#[serial]
async fn test_duplicates_keep_highest_priority() {
    let dedicated = file_with("key-a\nkey-b\n");
    let loader = ResourceLoader::new(model_api())
        .source(ResourceSource::Dedicated(dedicated.path().to_path_buf()))
        .source(ResourceSource::Environment("TEST_MODEL_API_KEYS".to_string()));

    let entries = temp_env::async_with_vars(
        [("TEST_MODEL_API_KEYS", Some("key-b\nkey-c"))],
        loader.load_entries(),
    )
    .await
    .unwrap();

    let values: Vec<_> = entries.iter().map(|e| e.value.as_str()).collect();
    assert_eq!(values, vec!["key-a", "key-b", "key-c"]);
    assert!(entries[1].source_label.starts_with("dedicated:"));
}

#[tokio::test]
#[serial]
async fn test_no_resource_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let loader = ResourceLoader::new(model_api())
        .source(ResourceSource::Explicit(vec![]))
        .source(ResourceSource::Dedicated(dir.path().join("model-api.txt")))
        .source(ResourceSource::Environment("TEST_MODEL_API_KEYS".to_string()));

    let error = temp_env::async_with_vars(
        [("TEST_MODEL_API_KEYS", None::<&str>)],
        loader.load(),
    )
    .await
    .err()
    .unwrap();

    assert!(matches!(error, ResilienceError::Config(_)));
    assert!(error.to_string().contains("no resource available"));

    let classified = ErrorClassifier::new().classify(
        &error,
        &pipeline_resilience::error_recovery::ClassifyContext::new("load_credentials"),
    );
    assert_eq!(classified.kind, ErrorKind::Configuration);
    assert!(classified.is_critical());
}

#[tokio::test]
#[serial]
async fn test_standard_chain_reads_dependency_env_var() {
    let loader = ResourceLoader::standard(model_api(), vec![]);
    assert_eq!(loader.sources().len(), 4);
    assert_eq!(
        loader.sources()[3],
        ResourceSource::Environment("MODEL_API_RESOURCES".to_string())
    );

    let entries = temp_env::async_with_vars(
        [("MODEL_API_RESOURCES", Some("key-from-env"))],
        loader.load_entries(),
    )
    .await
    .unwrap();
    assert!(entries.iter().any(|e| e.value == "key-from-env"));
}

#[tokio::test(start_paused = true)]
async fn test_time_boxed_pool_from_loader() {
    let loader = ResourceLoader::new(model_api())
        .source(ResourceSource::Explicit(vec!["key-0".into(), "key-1".into()]))
        .with_policy(ExhaustionPolicy::TimeBoxed(Duration::from_secs(3600)));
    let registry = ResourcePoolRegistry::new();
    registry.register(loader.load().await.unwrap()).await;

    assert_eq!(registry.rotate(&model_api()).await.unwrap().value, "key-0");
    assert!(registry.mark_disabled(&model_api(), 0, None).await);
    assert!(registry.mark_disabled(&model_api(), 1, Some(Duration::from_secs(30))).await);
    let exhausted = registry.rotate(&model_api()).await.unwrap_err();
    assert_eq!(exhausted.kind, ErrorKind::ResourceExhausted);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(registry.rotate(&model_api()).await.unwrap().value, "key-1");

    tokio::time::advance(Duration::from_secs(3600)).await;
    registry.mark_disabled(&model_api(), 1, None).await;
    assert_eq!(registry.rotate(&model_api()).await.unwrap().value, "key-0");

    let stats = registry.stats(&model_api()).await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.available, 1);
}
