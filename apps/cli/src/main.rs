use std::io::Write;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tracing_subscriber::EnvFilter;

use poe_bridge_core::prelude::*;
use poe_bridge_core::{db, telemetry};

/**
 * \brief CLI 程序入口：配置 Poe 代理、列出模型、发送对话。
 */
#[derive(Parser, Debug)]
#[command(name = "poe-bridge", version, about = "Chat with Poe bots through a local proxy")]
struct Cli {
    /** \brief 输出调试日志（等价于 RUST_LOG=debug） */
    #[arg(long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 回答设置问题并持久化。
     * \param api_key  代理 API Key
     * \param base_url 代理地址
     */
    Setup {
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        default_model: Option<String>,
        #[arg(long)]
        enable_telemetry: Option<bool>,
    },

    /**
     * \brief 列出代理可用的模型。
     */
    Models,

    /**
     * \brief 发送一条用户消息并显示回复（默认流式）。
     */
    Chat {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        system: Option<String>,
        #[arg(long, default_value_t = false)]
        no_stream: bool,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let conn = db::open_default_db().context("open settings database failed")?;
    db::migrate(&conn).context("apply migrations failed")?;
    let telemetry_enabled = db::get_telemetry_enabled(&conn).unwrap_or(false);
    telemetry::set_enabled(telemetry_enabled);

    match cli.command {
        Commands::Setup {
            api_key,
            base_url,
            default_model,
            enable_telemetry,
        } => {
            let mut vendor = PoeVendor::new();
            let answers = [("API key", api_key), ("Base URL", base_url)];
            for question in vendor.setup_questions() {
                let answer = answers
                    .iter()
                    .find(|(label, _)| *label == question.label)
                    .and_then(|(_, value)| value.as_deref());
                if let Some(value) = answer {
                    db::set_setting(&conn, &question.env_name, value)
                        .with_context(|| format!("save {} failed", question.env_name))?;
                }
            }
            if let Some(model) = default_model {
                db::set_default_model(&conn, &model).context("save default model failed")?;
            }
            if let Some(enabled) = enable_telemetry {
                db::set_telemetry_enabled(&conn, enabled).context("save telemetry failed")?;
                telemetry::set_enabled(enabled);
            }

            let settings = db::load_settings(&conn)?.overlay_env();
            match vendor.configure(&settings) {
                Ok(()) => println!(
                    "Saved {} settings (proxy={})",
                    vendor.name(),
                    vendor.client().base_url()
                ),
                Err(e) => println!("Saved, but setup is incomplete: {}", e),
            }
        }
        Commands::Models => {
            let registry = load_registry(&conn)?;
            let vendor = registry.require(poe_bridge_core::poe::VENDOR_NAME)?;
            let models = vendor.list_models().await.context("list models failed")?;
            for model in models {
                println!("{}", model);
            }
        }
        Commands::Chat {
            prompt,
            model,
            system,
            no_stream,
        } => {
            let model = match model {
                Some(m) => m,
                None => db::get_default_model(&conn)
                    .context("load default model failed")?
                    .context("no model given, pass --model or run: poe-bridge setup --default-model ...")?,
            };
            if prompt.trim().is_empty() {
                bail!("prompt must not be empty");
            }

            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(Message::system(system));
            }
            messages.push(Message::user(prompt));
            let options = ChatOptions::new(model);

            let registry = load_registry(&conn)?;
            let vendor = registry.require(poe_bridge_core::poe::VENDOR_NAME)?;

            telemetry::log_event(
                "cli.chat",
                &format!(
                    "vendor={} model={} stream={} msgs={}",
                    vendor.name(),
                    options.model,
                    !no_stream,
                    messages.len()
                ),
            );

            if no_stream {
                let reply = vendor
                    .send(&messages, &options)
                    .await
                    .context("send failed")?;
                println!("{}", reply);
            } else {
                let (mut sink, rx) = chunk_channel(64);
                let printer = tokio::spawn(async move {
                    let mut stream = Box::pin(rx.into_stream());
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(line) => {
                                println!("{}", line);
                                std::io::stdout().flush().ok();
                            }
                            Err(e) => {
                                tracing::debug!("stream ended: {}", e);
                                break;
                            }
                        }
                    }
                });

                let result = vendor.send_stream(&messages, &options, &mut sink).await;
                printer.await.context("stream printer panicked")?;
                result.context("send stream failed")?;
            }
        }
    }

    Ok(())
}

/**
 * \brief 从设置库与环境变量构建 Vendor 注册表。
 */
fn load_registry(conn: &db::Connection) -> Result<VendorRegistry> {
    let settings = db::load_settings(conn)
        .context("load settings failed")?
        .overlay_env();
    let mut registry = VendorRegistry::new();
    registry.register(PoeVendor::new(), &settings);
    Ok(registry)
}
