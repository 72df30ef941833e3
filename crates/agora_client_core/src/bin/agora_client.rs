#![forbid(unsafe_code)]

use std::net::SocketAddr;

use agora_client_core::{ClientConfig, ClientSession, ServerEvent, ServerTrust};
use agora_domain::now_millis;
use anyhow::Context as _;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: agora_client [--server host:port] [--sni name] [--name display-name]\n\
\n\
Commands (stdin):\n\
\t/name <display-name>     Set your display name\n\
\t/w <session-id> <text>   Whisper to a session\n\
\t/ping                    Round-trip check\n\
\t/quit                    Disconnect\n\
\t<text>                   Send a public message\n\
"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn,agora_client_core=info".to_string());
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::new(filter))
		.with_target(false)
		.init();
}

enum Command {
	Name(String),
	Whisper { to: String, text: String },
	Ping,
	Quit,
	Say(String),
}

fn parse_command(line: &str) -> Option<Command> {
	let line = line.trim_end_matches(['\r', '\n']);
	if line.trim().is_empty() {
		return None;
	}

	if let Some(rest) = line.strip_prefix("/name ") {
		return Some(Command::Name(rest.to_string()));
	}
	if let Some(rest) = line.strip_prefix("/w ") {
		let (to, text) = rest.split_once(' ').unwrap_or((rest, ""));
		return Some(Command::Whisper {
			to: to.to_string(),
			text: text.to_string(),
		});
	}
	match line.trim() {
		"/ping" => Some(Command::Ping),
		"/quit" => Some(Command::Quit),
		_ => Some(Command::Say(line.to_string())),
	}
}

fn print_event(ev: &ServerEvent) {
	match ev {
		ServerEvent::History(messages) => {
			for m in messages {
				println!("[{}] {}: {}", agora_domain::format_date(&m.date), m.session, m.text);
			}
		}
		ServerEvent::Users(users) => {
			let names: Vec<String> = users.iter().map(|u| format!("{} ({})", u.name, u.session_id)).collect();
			println!("* online: {}", names.join(", "));
		}
		ServerEvent::Message(m) => println!("[{}] {}: {}", agora_domain::format_date(&m.date), m.session, m.text),
		ServerEvent::Whisper(w) => println!("[{}] (whisper) {}: {}", agora_domain::format_date(&w.date), w.from_name, w.text),
		ServerEvent::Error {
			code,
			message,
			request_id,
		} => eprintln!("! {code} ({request_id}): {message}"),
		ServerEvent::Lagged { dropped } => eprintln!("! fell behind, {dropped} events dropped"),
		ServerEvent::Pong {
			client_time_unix_ms, ..
		} => println!("* pong in {}ms", now_millis().timestamp_millis() - client_time_unix_ms),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let mut cfg = ClientConfig {
		trust: ServerTrust::InsecureDev,
		..ClientConfig::default()
	};
	let mut initial_name: Option<String> = None;

	let mut args = std::env::args().skip(1);
	while let Some(arg) = args.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--server" => {
				let v = args.next().unwrap_or_else(|| usage_and_exit());
				cfg.server_addr = v.parse::<SocketAddr>().with_context(|| format!("--server {v}"))?;
			}
			"--sni" => cfg.server_name = args.next().unwrap_or_else(|| usage_and_exit()),
			"--name" => initial_name = Some(args.next().unwrap_or_else(|| usage_and_exit())),
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let (mut session, welcome) = ClientSession::connect(cfg).await?;
	info!(session = %session.session_id(), server = %welcome.server_name, "joined");
	println!("* you are {}", session.session_id());

	if let Some(name) = initial_name {
		session.save_name(name).await?;
	}

	let mut lines = BufReader::new(tokio::io::stdin()).lines();

	loop {
		tokio::select! {
			line = lines.next_line() => {
				let Some(line) = line? else {
					break;
				};
				match parse_command(&line) {
					None => {}
					Some(Command::Quit) => break,
					Some(Command::Name(name)) => { session.save_name(name).await?; }
					Some(Command::Whisper { to, text }) => { session.send_whisper(to, text).await?; }
					Some(Command::Ping) => { session.ping(now_millis().timestamp_millis()).await?; }
					Some(Command::Say(text)) => { session.send_message(text).await?; }
				}
			}
			ev = session.next_event() => {
				let ev = ev?;
				print_event(&ev);
			}
		}
	}

	session.close(0, "bye");
	Ok(())
}
