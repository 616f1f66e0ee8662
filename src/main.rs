#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fiscal_registry::server::run().await
}
