#![doc = include_str!("../README.md")]

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub(crate) mod item;
pub(crate) mod key;
pub mod listener;
pub mod message;
pub mod mpn;
pub(crate) mod strategy;
pub mod subscription;
pub mod update;

pub use config::{
    EngineConfig, MessageOptions, MpnDeviceConfig, MpnSubscriptionConfig, SecondLevelConfig,
    SubscriptionConfig, Transport,
};
pub use engine::{Engine, SharedEngine};
pub use error::{ClientError, ClientResult};
pub use listener::{
    ClientMessageListener, MpnDeviceListener, MpnSubscriptionListener, SubscriptionListener,
};
pub use message::MessageFailure;
pub use mpn::{DeviceStatus, MpnSubscriptionStatus};
pub use subscription::SubscriptionStatus;
pub use update::ItemUpdate;

pub use tlcp_core as core;
