use clap::Parser;
use relay_client::config::DEFAULT_CONFIG_FILE;
use relay_client::{ClientConfig, ClientError, RelayClient};
use relay_common::{ChatId, Delivery};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const RETURN: &str = "return";

#[derive(Parser)]
#[command(name = "relay-client")]
#[command(about = "Terminal client for the chat relay")]
struct Cli {
    /// JSON file with `token` and `address`
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Bearer token, overrides the config file
    #[arg(long)]
    token: Option<String>,

    /// Relay address (host:port), overrides the config file
    #[arg(long)]
    address: Option<String>,
}

fn init_tracing() -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::never("logs", "relay-client.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "relay_client=debug,info".into());

    // File only; the terminal belongs to the chat UI
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    guard
}

enum Screen {
    Menu,
    InChat(ChatId),
}

struct App {
    config: ClientConfig,
    input: Lines<BufReader<Stdin>>,
}

impl App {
    fn new(config: ClientConfig) -> Self {
        Self {
            config,
            input: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    async fn run(&mut self) -> Result<(), ClientError> {
        let mut screen = Screen::Menu;
        loop {
            screen = match screen {
                Screen::Menu => match self.menu().await? {
                    Some(next) => next,
                    None => return Ok(()),
                },
                Screen::InChat(ch_id) => {
                    self.chat(&ch_id).await?;
                    Screen::Menu
                }
            };
            println!();
        }
    }

    /// `None` on end of input.
    async fn read_line(&mut self) -> Result<Option<String>, ClientError> {
        Ok(self
            .input
            .next_line()
            .await?
            .map(|line| line.trim().to_string()))
    }

    async fn connect(&self) -> Result<RelayClient, ClientError> {
        RelayClient::connect(&self.config.address, &self.config.token).await
    }

    /// Returns the next screen, or `None` to quit.
    async fn menu(&mut self) -> Result<Option<Screen>, ClientError> {
        println!("--- Main menu ---");
        println!("1. Create a new chat with another user");
        println!("2. Enter a chat");
        println!();
        println!("Enter your choice (type exit or press Ctrl+C to quit)");

        let Some(choice) = self.read_line().await? else {
            return Ok(None);
        };

        match choice.as_str() {
            "1" => {
                println!("Enter the ID of the user to chat with, or {} to go back.", RETURN);
                let Some(peer) = self.read_line().await? else {
                    return Ok(None);
                };
                if peer == RETURN || peer.is_empty() {
                    return Ok(Some(Screen::Menu));
                }

                match self.create_chat(&peer).await {
                    Ok(ch_id) => println!("Your chat ID: {}", ch_id),
                    Err(ClientError::Unauthorized) => return Err(ClientError::Unauthorized),
                    Err(e) => {
                        error!("Failed to create chat with {}: {}", peer, e);
                        println!("Could not create chat: {}", e);
                    }
                }
                Ok(Some(Screen::Menu))
            }
            "2" => {
                println!("Enter the chat ID, or {} to go back.", RETURN);
                let Some(ch_id) = self.read_line().await? else {
                    return Ok(None);
                };
                if ch_id == RETURN || ch_id.is_empty() {
                    return Ok(Some(Screen::Menu));
                }
                Ok(Some(Screen::InChat(ChatId::new(ch_id))))
            }
            "exit" => Ok(None),
            _ => {
                println!("No such action");
                Ok(Some(Screen::Menu))
            }
        }
    }

    async fn create_chat(&self, peer: &str) -> Result<ChatId, ClientError> {
        let mut client = self.connect().await?;
        let result = client.create_chat(peer).await;
        if let Err(e) = client.close().await {
            error!("Failed to close connection: {}", e);
        }
        result
    }

    async fn chat(&mut self, ch_id: &ChatId) -> Result<(), ClientError> {
        let client = match self.connect().await {
            Ok(client) => client,
            Err(ClientError::Unauthorized) => return Err(ClientError::Unauthorized),
            Err(e) => {
                error!("Failed to connect: {}", e);
                println!("Failed to connect: {}", e);
                return Ok(());
            }
        };
        info!("Entered chat {}", ch_id);
        println!("Chat {}. Type a message and press Enter, {} to leave.", ch_id, RETURN);

        let (mut sender, mut receiver) = client.split();

        let watched = ch_id.clone();
        let mut printer = tokio::spawn(async move {
            loop {
                match receiver.next_delivery().await {
                    Ok(Some(Delivery::NewMessage(delivery))) if delivery.ch_id == watched => {
                        println!("{}: {}", delivery.message.from_id, delivery.message.body);
                    }
                    Ok(Some(Delivery::Error(body))) => {
                        error!("Server error: {}", body.error);
                        println!("Error: {}", body.error);
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        println!("Connection closed by server");
                        break;
                    }
                    Err(e) => {
                        error!("Read failed: {}", e);
                        println!("Connection lost");
                        break;
                    }
                }
            }
        });

        loop {
            tokio::select! {
                _ = &mut printer => break,
                line = self.input.next_line() => {
                    let Some(line) = line? else { break };
                    let line = line.trim();
                    if line == RETURN {
                        break;
                    }
                    if line.is_empty() {
                        continue;
                    }
                    if let Err(e) = sender.send_message(ch_id, line).await {
                        error!("Send failed: {}", e);
                        println!("Failed to send message");
                        break;
                    }
                }
            }
        }

        if let Err(e) = sender.close().await {
            error!("Failed to close connection: {}", e);
        }
        printer.abort();
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let guard = init_tracing();

    let config = ClientConfig::load_or_default(&cli.config)?.with_overrides(cli.token, cli.address);
    config.validate()?;
    info!("Starting relay client for {}", config.address);

    let mut app = App::new(config);
    let result = tokio::select! {
        result = app.run() => result,
        _ = tokio::signal::ctrl_c() => Ok(()),
    };

    match result {
        Err(ClientError::Unauthorized) => {
            println!("unauthorized: wrong token");
            drop(guard);
            std::process::exit(1);
        }
        other => Ok(other?),
    }
}
