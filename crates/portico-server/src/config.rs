//! Command-line interface

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "portico")]
#[command(about = "Expose loopback-tunneled backends at public hostnames", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the edge proxy server
    Server(ServerArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Admin domain; overrides the stored value
    #[arg(long)]
    pub admin_domain: Option<String>,

    /// SSH server port advertised to tunnel clients
    #[arg(long, default_value_t = 22)]
    pub ssh_server_port: u16,

    /// TLS certificate storage directory
    #[arg(long, default_value = "portico_certs")]
    pub cert_dir: String,

    /// Print the admin login link at startup
    #[arg(long)]
    pub print_login: bool,

    /// HTTP (insecure) port
    #[arg(long, default_value_t = 80)]
    pub http_port: u16,

    /// HTTPS (secure) port
    #[arg(long, default_value_t = 443)]
    pub https_port: u16,

    /// Serve unencrypted (HTTP) requests instead of redirecting them
    #[arg(long)]
    pub allow_http: bool,

    /// Advertised public IP; discovered through the DNS service when absent
    #[arg(long)]
    pub public_ip: Option<String>,

    /// Path of the persisted state file
    #[arg(long, default_value = "portico_db.json")]
    pub db_path: String,

    /// Contact email registered with the ACME CA
    #[arg(long)]
    pub acme_email: Option<String>,

    /// Use the Let's Encrypt staging environment
    #[arg(long)]
    pub acme_staging: bool,

    /// Base URL of the external DNS provisioning service
    #[arg(long, default_value = "https://takingnames.io")]
    pub dns_service_url: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
