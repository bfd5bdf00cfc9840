//! Admin-domain bootstrap
//!
//! Runs once, on first start with an empty store: the operator either types
//! a domain they already control, or delegates one through the external DNS
//! service. The delegated flow only plants the provisioning request and
//! prints the link; the `/namedrop/auth-success` callback finishes it while
//! the server is running.

use anyhow::{bail, Context, Result};
use portico_cert::CertManager;
use portico_dns::NamedropClient;
use portico_store::{random_code, DnsRecord, DnsRequest, Store};
use tracing::info;

pub async fn set_admin_domain(
    store: &Store,
    certs: &CertManager,
    dns: &NamedropClient,
    public_ip: &str,
) -> Result<()> {
    let action = prompt(
        "\nNo admin domain set. Enter '1' to input manually, or '2' to configure through the DNS service\n",
    )?;

    match action.as_str() {
        "1" => {
            let domain = prompt("\nEnter admin domain:\n")?;
            certs
                .manage(std::slice::from_ref(&domain))
                .await
                .with_context(|| format!("cert_acquisition_failed for admin domain {domain}"))?;
            store.set_admin_domain(&domain)?;
            info!(admin_domain = %domain, "admin domain configured");
        }
        "2" => {
            info!("requesting bootstrap domain");
            let bootstrap_domain = dns.bootstrap_domain().await?;

            info!(%bootstrap_domain, "acquiring certificate");
            certs
                .manage(std::slice::from_ref(&bootstrap_domain))
                .await
                .with_context(|| {
                    format!("cert_acquisition_failed for bootstrap domain {bootstrap_domain}")
                })?;

            let request_id = random_code(32);
            store.set_dns_request(
                &request_id,
                DnsRequest::new(
                    true,
                    vec![DnsRecord {
                        record_type: "A".to_string(),
                        value: public_ip.to_string(),
                        ttl: 300,
                    }],
                ),
            )?;

            let link = dns.request_url(&bootstrap_domain, &request_id);
            println!("Use the link below to select an admin domain:\n\n{link}\n");
        }
        other => bail!("config_invalid: unrecognised option {other:?}"),
    }

    Ok(())
}

fn prompt(text: &str) -> Result<String> {
    use std::io::Write;

    print!("{text}");
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
