use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "gen_certs")]
#[command(about = "Generate the self-signed certificate used by the server and client", long_about = None)]
struct Args {
    /// Directory the certificate and key are written to
    #[arg(long, default_value = "ssl")]
    out_dir: PathBuf,

    /// Hostnames and IPs the certificate is valid for; the first is the common name
    #[arg(long = "host", default_values = ["foobar.com", "localhost", "127.0.0.1"])]
    hosts: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    println!("Generating self-signed certificate for {}...", args.hosts.join(", "));

    fs::create_dir_all(&args.out_dir)
        .context(format!("Failed to create directory: {:?}", args.out_dir))?;

    let hosts: Vec<&str> = args.hosts.iter().map(String::as_str).collect();
    let (cert_pem, key_pem) = multiplex::certs::generate_self_signed(&hosts)?;

    let cert_file = args.out_dir.join("server.crt");
    let key_file = args.out_dir.join("server.key");

    fs::write(&cert_file, cert_pem).context(format!("Failed to write {:?}", cert_file))?;
    fs::write(&key_file, key_pem).context(format!("Failed to write {:?}", key_file))?;

    println!("   Saved {}", cert_file.display());
    println!("   Saved {}", key_file.display());

    Ok(())
}
