//! # pubsub-emulator
//!
//! An in-process emulator of a managed publish/subscribe message broker,
//! for development and test environments that want Pub/Sub-shaped
//! semantics (ordering keys, lease-based redelivery, dead-lettering, flow
//! control) without a network dependency.
//!
//! ## Quick Start
//!
//! ### Publish
//!
//! ```
//! use pubsub_emulator::client::Client;
//! use pubsub_emulator::message::PublishMessage;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = Client::new(Some("local-project"));
//!     let topic = client.topic("orders");
//!     topic.create(None).unwrap();
//!
//!     let awaiter = topic.publish(PublishMessage::new("order-created")).await.unwrap();
//!     topic.flush();
//!     let message_id = awaiter.get().await.unwrap();
//!     println!("published {message_id}");
//! }
//! ```
//!
//! ### Subscribe
//!
//! ```
//! use pubsub_emulator::client::Client;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = Client::new(Some("local-project"));
//!     let topic = client.topic("orders");
//!     topic.create(None).unwrap();
//!
//!     let subscription = client.subscription("orders-worker");
//!     subscription.create("orders", None).unwrap();
//!
//!     let handle = subscription.receive(|message| async move {
//!         println!("{:?}", message.message.data);
//!         let _ = message.ack().await;
//!     });
//!
//!     tokio::time::sleep(std::time::Duration::from_millis(50)).await;
//!     handle.stop().await;
//! }
//! ```

pub mod ack_manager;
pub mod broker;
pub mod client;
pub mod error;
pub mod flow_control;
pub mod lease_manager;
pub mod message;
pub mod message_stream;
pub mod publisher;
pub mod schema;
pub mod subscription;
pub mod time;
pub mod topic;
