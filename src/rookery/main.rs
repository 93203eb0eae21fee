//! Rookery CLI, used to launch a directory server node

#[macro_use]
extern crate tracing;

mod server;

use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(
	name = "rookery",
	about = "Peer-to-peer chat directory overlay for LAN deployments"
)]
struct Opt {
	#[structopt(subcommand)]
	cmd: Command,
}

#[derive(StructOpt, Debug)]
enum Command {
	/// Run a directory server node
	Server {
		/// Node name, used in logs and as the shard file name
		name: String,
	},
}

#[tokio::main]
async fn main() {
	let opt = Opt::from_args();

	if std::env::var("RUST_LOG").is_err() {
		std::env::set_var("RUST_LOG", "rookery=info");
	}
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
		.init();

	let res = match opt.cmd {
		Command::Server { name } => server::run_server(name).await,
	};

	if let Err(e) = res {
		eprintln!("Error: {}", e);
		std::process::exit(1);
	}
}
