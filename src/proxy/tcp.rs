//! Plain TCP forwarding to a fixed destination

use super::{ProxyError, Sniffed, Target, TargetSniffer};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;

/// Every connection goes to the same configured target; nothing is read
#[derive(Debug, Clone)]
pub struct StaticTarget {
    target: Target,
}

impl StaticTarget {
    pub fn new(target: Target) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }
}

#[async_trait]
impl TargetSniffer for StaticTarget {
    async fn sniff(&self, _stream: &mut TcpStream) -> Result<Sniffed, ProxyError> {
        Ok(Sniffed {
            target: self.target.clone(),
            initial_data: Bytes::new(),
            reply: None,
        })
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}
