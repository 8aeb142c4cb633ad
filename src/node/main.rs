use crate::{configs::NodeConfig, node::Node};
use log::*;

mod configs;
mod data_collection;
mod node;

#[tokio::main]
pub async fn main() {
    env_logger::init();
    let config = match NodeConfig::new() {
        Ok(parsed_config) => parsed_config,
        Err(e) => panic!("{e}"),
    };
    info!("{}: Starting with {config:?}", config.node.id);
    let node = match Node::new(config) {
        Ok(node) => node,
        Err(e) => panic!("Failed to set up the clock: {e}"),
    };
    node.run().await;
}
