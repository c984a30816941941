use kaiwa::audio::{list_input_devices, CpalSource};
use kaiwa::realtime::WsConnector;
use kaiwa::token::HttpTokenClient;
use kaiwa::usage::HttpBillingClient;
use kaiwa::{settings, Role, Session, SessionDeps, SessionEvent, SessionSettings};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

fn main() {
    env_logger::init();

    if std::env::args().any(|a| a == "--devices") {
        for name in list_input_devices() {
            println!("{}", name);
        }
        return;
    }

    let settings = settings::load();
    let runtime = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
    let deps = SessionDeps {
        credentials: Arc::new(HttpTokenClient::new(&settings.backend_url)),
        connector: Arc::new(WsConnector::new(&settings.realtime_url, &settings.model)),
        audio: Arc::new(CpalSource::new(&settings.mic_device)),
        billing: Arc::new(HttpBillingClient::new(&settings.backend_url)),
    };
    let session = Session::new(deps, SessionSettings::from(&settings));

    if let Err(e) = runtime.block_on(run(session)) {
        eprintln!("[kaiwa] {}", e);
        std::process::exit(1);
    }
}

async fn run(mut session: Session) -> kaiwa::Result<()> {
    session.start().await?;
    println!("Connected. Press Enter to talk, Enter again to send. Type q to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printed = 0usize;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if line.trim() == "q" => break,
                    Ok(Some(_)) => {
                        if session.is_transmitting() {
                            if session.release()? {
                                println!("... sent");
                            }
                        } else if session.press() {
                            println!("● listening (Enter to send)");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("[kaiwa] stdin: {}", e);
                        break;
                    }
                }
            }
            event = session.next_event() => {
                match event {
                    Some(SessionEvent::LogUpdated) => printed = print_new_entries(&session, printed),
                    Some(SessionEvent::UsageUpdated) => log::debug!("[kaiwa] usage {:?}", session.usage()),
                    Some(SessionEvent::RemoteError(e)) => eprintln!("[kaiwa] {}", e),
                    Some(SessionEvent::Disconnected) | None => {
                        eprintln!("[kaiwa] disconnected");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.stop();
    // Let the usage debit go out before the runtime shuts down.
    if let Some(debit) = session.take_debit_task() {
        let _ = debit.await;
    }
    Ok(())
}

fn print_new_entries(session: &Session, printed: usize) -> usize {
    let finals: Vec<_> = session.log().iter().filter(|e| e.is_final).collect();
    for entry in finals.iter().skip(printed) {
        let who = match entry.role {
            Role::User => "you",
            Role::Assistant => "ai ",
        };
        println!("{} {}: {}", entry.timestamp.format("%H:%M:%S"), who, entry.text);
    }
    finals.len().max(printed)
}
