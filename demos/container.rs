use std::sync::Arc;
use std::time::Duration;

use hll_container::{Config, Container, MemoryBackend};
use tracing::info_span;

#[tokio::main]
async fn main() -> hll_container::Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let container = Container::builder()
        .config(Config {
            save_interval: Duration::from_millis(100),
            ..Config::default()
        })
        .backend(backend.clone())
        .span(info_span!("hll", instance = "demo"))
        .open()
        .await?;

    for i in 0..10 {
        container.add_log("page:/", Some(format!("visitor-{}", i).as_bytes()), 3_600);
    }
    let visitors: Vec<String> = (0..5_000).map(|i| format!("visitor-{}", i)).collect();
    container.add_multi_log("page:/docs", &visitors, 0);

    println!("page:/ estimate = {}", container.get_cardinality("page:/"));
    println!("page:/docs estimate = {}", container.get_cardinality("page:/docs"));

    container.del_log("page:/docs").await?;
    println!("keys after delete = {}", container.key_count());

    container.shutdown().await?;
    println!("records persisted = {}", backend.len());
    Ok(())
}
