mod node;

pub use node::{
    HealthCheckResult, NodeCreate, NodeFilter, NodePatch, NodeProtocol, PoolStatistics, ProxyNode,
};
