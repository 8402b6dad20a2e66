use std::{
    fmt,
    net::SocketAddr,
    path::PathBuf,
};

use clap::Parser;
use url::Url;

#[derive(Parser, Clone)]
#[clap(author = "Machined Developers")]
pub struct LocalConfig {
    /// Host port the daemon should bind to
    #[clap(short, long, default_value = "8909")]
    pub port: u16,

    /// Host interface to bind to
    #[clap(short, long, default_value = "0.0.0.0")]
    pub interface: std::net::Ipv4Addr,

    /// Prefix for the follow file name, so several instances can share a
    /// working directory
    #[clap(long, default_value = "")]
    pub file_prefix: String,

    /// Address of the IPFS node's HTTP API
    #[clap(long, default_value = "http://127.0.0.1:5001")]
    pub ipfs_api: Url,
}

impl fmt::Debug for LocalConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("file_prefix", &self.file_prefix)
            .field("ipfs_api", &self.ipfs_api.as_str())
            .finish()
    }
}

impl LocalConfig {
    pub fn http_bind_address(&self) -> SocketAddr {
        (self.interface, self.port).into()
    }

    pub fn follow_file(&self) -> PathBuf {
        format!("{}follows.json", self.file_prefix).into()
    }

    #[cfg(test)]
    pub fn new_for_test(file_prefix: &str) -> anyhow::Result<Self> {
        // Easiest way to get a config object with defaults is to parse from
        // a command line.
        Ok(Self::try_parse_from([
            "machined",
            "--file-prefix",
            file_prefix,
        ])?)
    }
}
