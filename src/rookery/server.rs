use rookery_ring::node::{DirectoryNode, RingConfig};
use rookery_util::error::Error;

pub async fn run_server(name: String) -> Result<(), Error> {
	info!("Starting directory node '{}'", name);
	let node = DirectoryNode::init(name, RingConfig::default()).await?;

	let watcher = node.clone();
	tokio::spawn(async move {
		if let Err(e) = tokio::signal::ctrl_c().await {
			error!("Cannot watch for SIGINT: {}", e);
			return;
		}
		info!("SIGINT received, shutting down");
		watcher.shutdown();
	});

	node.run().await;
	Ok(())
}
