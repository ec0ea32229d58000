//! Remote endpoint resolution
//!
//! - `provider`: describe/start calls against the instance lifecycle API
//! - `resolver`: cached, exclusive resolution with generation tracking

pub mod provider;
pub mod resolver;

pub use provider::{
    AwsCliProvider, InstanceDescription, InstanceProvider, PowerState, ProviderError,
};
pub use resolver::{Endpoint, EndpointResolver, EndpointState, ResolverSettings};
