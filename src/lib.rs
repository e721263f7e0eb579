#![doc = include_str!("../README.md")]

pub mod component;
pub mod config;
pub mod deployment;
pub mod dot;
pub mod error;
pub mod membership;
pub mod registry;
pub mod remote;
pub mod router;
pub mod runtime;
pub mod strategies;
pub mod strategy;
pub mod worker;
pub mod workflow;

pub use component::{
  Callback, CallbackArgs, CallbackBody, CallbackEnv, CallbackFailure, CallbackResult, Component,
  ComponentBuilder, FieldsState, Port, StateCapability,
};
pub use config::Config;
pub use deployment::{DeployedWorkflow, DeploymentId, InstanceDeployment, Route};
pub use error::{ConnectFailure, DefinitionError, Error};
pub use membership::{LeaveReason, MemberEvent, MemberEvents, SubscriptionId, SubscriptionPolicy};
pub use registry::{Entity, Registry};
pub use remote::{NodeId, NodeRole};
pub use runtime::Runtime;
pub use strategy::{Context, Hook, InvocationData, Strategy, StrategyBuilder};
pub use worker::{WorkerId, WorkerRef};
pub use workflow::{Endpoint, Node, Workflow, WorkflowBuilder};
