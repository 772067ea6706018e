use anyhow::{Result, bail};
use cdseutils::{
    CdseToken, DEFAULT_AUTH_SERVER_URL, Download, DownloadOptions, ODataClient, S3Credentials,
    SaveMode,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "cdse", version, about = "Copernicus Data Space Ecosystem utilities")]
struct Cli {
    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(long, env = "CDSE_USERNAME", global = true)]
    username: Option<String>,

    #[arg(long, env = "CDSE_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    /// OpenID Connect token endpoint.
    #[arg(long, env = "CDSE_AUTH_URL", default_value = DEFAULT_AUTH_SERVER_URL, global = true)]
    auth_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print a fresh access token.
    Token,
    /// List the collections available via OData.
    Collections,
    /// Download products by ID, or a single file by URL.
    Download {
        /// Product IDs (duplicates are downloaded once).
        ids: Vec<String>,
        #[arg(long, conflicts_with = "ids")]
        url: Option<String>,
        #[arg(long)]
        outdir: Option<PathBuf>,
        #[arg(long)]
        outfile: Option<PathBuf>,
        /// OVERWRITE, NO_OVERWRITE or RAISE.
        #[arg(long, default_value = "NO_OVERWRITE")]
        save_mode: SaveMode,
        #[arg(long, default_value_t = cdseutils::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        #[arg(long)]
        no_progress: bool,
    },
    /// Create temporary S3 credentials for the eodata bucket.
    ///
    /// The credentials stay valid on the key server until they expire.
    S3Credentials {
        /// Delete the credentials from the key server after printing them.
        #[arg(long)]
        revoke: bool,
    },
}

fn init_logger(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cdseutils=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cdseutils=info,warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();
}

fn token(cli: &Cli) -> Result<CdseToken> {
    CdseToken::new(
        cli.username.clone(),
        cli.password.clone(),
        Some(cli.auth_url.clone()),
    )
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    match &cli.command {
        Command::Token => {
            let token = token(&cli)?;
            println!("{}", token.get()?);
        }
        Command::Collections => {
            for name in cdseutils::collections()? {
                println!("{}", name);
            }
        }
        Command::Download {
            ids,
            url,
            outdir,
            outfile,
            save_mode,
            chunk_size,
            no_progress,
        } => {
            if ids.is_empty() && url.is_none() {
                bail!("nothing to download: give product IDs or --url");
            }
            let client = ODataClient::new(Some(token(&cli)?.into()))?;
            let options = DownloadOptions {
                outfile: outfile.clone(),
                outdir: outdir.clone(),
                chunk_size: *chunk_size,
                progress: !no_progress,
                save_mode: *save_mode,
            };

            let results = match url {
                Some(url) => vec![client.download(url, &options)?],
                None => client.download_products(ids, &options)?,
            };
            for r in results {
                match r {
                    Download::Downloaded(p) => println!("downloaded {}", p.display()),
                    Download::Skipped(p) => println!("skipped {} (already exists)", p.display()),
                }
            }
        }
        Command::S3Credentials { revoke } => {
            let creds = S3Credentials::new(Arc::new(token(&cli)?))?;
            println!("endpoint_url: {}", cdseutils::CDSE_S3_ENDPOINT_URL);
            println!("access_id: {}", creds.access_id());
            println!("secret: {}", creds.secret());
            println!("expiration_date: {}", creds.expiration_date().to_rfc3339());
            if *revoke {
                creds.delete()?;
                println!("note: these credentials have been revoked on the key server");
            } else {
                creds.persist();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_credentials_are_kept_unless_revoked() {
        let cli = Cli::try_parse_from(["cdse", "s3-credentials"]).unwrap();
        assert!(matches!(cli.command, Command::S3Credentials { revoke: false }));

        let cli = Cli::try_parse_from(["cdse", "s3-credentials", "--revoke"]).unwrap();
        assert!(matches!(cli.command, Command::S3Credentials { revoke: true }));

        assert!(Cli::try_parse_from(["cdse", "s3-credentials", "--keep"]).is_err());
    }
}
