use anyhow::Result;
use bitcoin::consensus::encode::serialize_hex;
use clap::Parser;
use tracing::{error, info};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    fmt::{self},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};
use walletcli::{
    config::{self, Cli, Command},
    wallet::Wallet,
};

#[tokio::main]
async fn main() -> Result<()> {
    // guard must live as long as main
    let _guard = logger_init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let wallet = Wallet::open(&cfg)?;

    if let Err(e) = run(&wallet, cli.command).await {
        error!("command failed: {:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(wallet: &Wallet, command: Command) -> Result<()> {
    match command {
        Command::Fees => {
            println!("{}", serde_json::to_string_pretty(&wallet.fees().await?)?);
        }
        Command::Utxos => {
            let utxos = wallet.utxos().await?;
            let total: u64 = utxos.iter().map(|u| u.value.to_sat()).sum();
            for utxo in &utxos {
                let state = if utxo.confirmed { "confirmed" } else { "pending" };
                println!("{} {} {}", utxo.out_point, utxo.value.to_sat(), state);
            }
            println!("{} utxo(s), {} sats", utxos.len(), total);
        }
        Command::Select {
            to,
            amount,
            fee_rate,
        } => {
            let (unsigned, selection) = wallet.select(&to, amount, fee_rate).await?;
            for utxo in &selection.selected_utxos {
                println!("{} {}", utxo.out_point, utxo.value.to_sat());
            }
            println!(
                "fee {} sats ({:.2} sat/vB), change {} sats",
                selection.fee.to_sat(),
                selection.fee_rate,
                selection.change.to_sat()
            );
            println!("{}", unsigned.to_base64());
        }
        Command::Send {
            to,
            amount,
            fee_rate,
            broadcast,
        } => {
            let tx = wallet.send(&to, amount, fee_rate).await?;
            println!("{}", serialize_hex(&tx));
            if broadcast {
                println!("{}", wallet.broadcast(&tx).await?);
            }
        }
        Command::Rbf {
            txid,
            fee_rate,
            broadcast,
        } => {
            let report = wallet.rbf(&txid, fee_rate).await?;
            println!(
                "minimum replacement: {} sats, {} sat/vB",
                report.minimum_fee, report.minimum_fee_rate
            );
            if let Some(recommendations) = report.recommendations {
                let tiers = [
                    ("medium", recommendations.medium),
                    ("high", recommendations.high),
                    ("higher", recommendations.higher),
                    ("highest", recommendations.highest),
                ];
                for (name, tier) in tiers {
                    let Some(tier) = tier else { continue };
                    match tier.fee {
                        Some(fee) => println!("{}: {} sat/vB, {} sats", name, tier.fee_rate, fee),
                        None => println!("{}: {} sat/vB, not enough funds", name, tier.fee_rate),
                    }
                }
            }
            if let Some(tx) = report.replacement {
                println!("{}", serialize_hex(&tx));
                if broadcast {
                    println!("{}", wallet.broadcast(&tx).await?);
                }
            }
        }
        Command::SignPsbt {
            psbt,
            address,
            indexes,
            finalize,
        } => {
            println!("{}", wallet.sign_psbt(&psbt, &address, indexes, finalize).await?);
        }
        Command::SignMessage {
            address,
            message,
            protocol,
        } => {
            let signed = wallet
                .sign_message(address.as_deref(), &message, protocol)
                .await?;
            println!("{}", serde_json::to_string_pretty(&signed)?);
        }
        Command::VerifyMessage {
            address,
            message,
            signature,
        } => {
            let valid = wallet.verify_message(&address, &message, &signature)?;
            info!("signature for {} valid: {}", address, valid);
            println!("{}", valid);
        }
    }
    Ok(())
}

fn logger_init() -> WorkerGuard {
    let formatting_layer = fmt::layer().pretty().with_writer(std::io::stdout);
    let file_appender = RollingFileAppender::new(Rotation::HOURLY, "logs/walletcli", "walletcli.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking)
        .with_filter(tracing_subscriber::filter::LevelFilter::DEBUG)
        .boxed();

    Registry::default()
        .with(formatting_layer)
        .with(file_layer)
        .with(EnvFilter::from_default_env())
        .init();

    guard
}
