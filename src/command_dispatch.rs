//! Purpose: Hold top-level CLI command dispatch for `rtchat`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Command output goes to stdout as JSON, except `watch` (console format by default)
//! and `smoke` (progress lines).
//! Invariants: Helpers in `main.rs` remain the source of parsing and rendering logic.

use super::*;

const SMOKE_ENTRY_KEY: &str = "123";
const SMOKE_MEMBER: &str = "user123";

pub(super) fn dispatch_command(
    command: Command,
    connection: ConnectionArgs,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Smoke => {
            let outcome = session_config(&connection)
                .and_then(|config| Session::connect(&config))
                .and_then(|session| run_smoke(&session));
            match outcome {
                Ok(()) => {
                    println!("\nAll smoke checks passed.");
                    Ok(RunOutcome::ok())
                }
                Err(err) => {
                    eprintln!("{}", smoke_failure_text(&err));
                    Ok(RunOutcome::with_code(1))
                }
            }
        }
        Command::Watch {
            path,
            timeout,
            json,
        } => {
            let timeout = timeout.as_deref().map(parse_duration).transpose()?;
            let session = Session::connect(&session_config(&connection)?)?;
            let collection = match path {
                Some(path) => session.collection(&path)?,
                None => session.chats(),
            };
            let watched = collection.path().clone();
            let mut subscription = collection.subscribe()?;
            eprintln!("Watching '{watched}' for updates. Press Ctrl+C to stop.");

            let deadline = timeout.map(|timeout| Instant::now() + timeout);
            loop {
                let next = match deadline {
                    Some(deadline) => {
                        let Some(wait) = remaining(deadline) else {
                            break;
                        };
                        match subscription.next_timeout(wait) {
                            Err(err) if is_timeout(&err) => break,
                            other => other?,
                        }
                    }
                    None => subscription.next().transpose()?,
                };
                let Some(event) = next else {
                    break;
                };
                if json {
                    emit_json(json!({
                        "event": event.kind.as_str(),
                        "location": event_location(&watched, &event),
                        "path": event.path,
                        "data": event.data,
                    }));
                } else {
                    print_event(&watched, &event);
                }
            }
            Ok(RunOutcome::ok())
        }
        Command::Add { data, key, target } => {
            let payload = parse_inline_json(&data)?;
            let session = Session::connect(&session_config(&connection)?)?;
            let collection = collection(&session, target);
            let key = collection.add(&payload, key.as_deref())?;
            emit_json(json!({
                "key": key,
                "path": format!("{}/{key}", collection.path()),
            }));
            Ok(RunOutcome::ok())
        }
        Command::Query {
            user,
            filters,
            order_by,
            limit,
            target,
        } => {
            let query = build_query(user, &filters, order_by, limit)?;
            let session = Session::connect(&session_config(&connection)?)?;
            let records = collection(&session, target).query(&query)?;
            emit_json(records_json(records));
            Ok(RunOutcome::ok())
        }
        Command::List { limit, target } => {
            let session = Session::connect(&session_config(&connection)?)?;
            let records = collection(&session, target).list(limit)?;
            emit_json(records_json(records));
            Ok(RunOutcome::ok())
        }
        Command::Get { key, target } => {
            let session = Session::connect(&session_config(&connection)?)?;
            let collection = collection(&session, target);
            match collection.entry(&key)? {
                Some(record) => {
                    emit_json(record.into_value());
                    Ok(RunOutcome::ok())
                }
                None => Err(Error::new(ErrorKind::NotFound)
                    .with_message("entry not found")
                    .with_path(collection.path())
                    .with_key(key)
                    .with_hint("Use `rtchat list` to see existing keys.")),
            }
        }
        Command::Serve {
            bind,
            allow_non_loopback,
            require_auth,
            max_body_bytes,
            max_streams,
            keep_alive,
            seed,
        } => {
            let config = serve::ServeConfig {
                bind: parse_bind(&bind)?,
                allow_non_loopback,
                auth_token: require_auth,
                max_body_bytes,
                max_streams,
                keep_alive: parse_duration(&keep_alive)?,
                seed: seed.as_ref().map(read_seed_file).transpose()?,
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(serve::serve(config))?;
            Ok(RunOutcome::ok())
        }
    }
}

fn run_smoke(session: &Session) -> Result<(), Error> {
    let chats = session.chats();
    let chat_log = session.chat_log();

    println!("1. Adding a chat to '{}'", chats.path());
    let payload = json!({
        "users": [SMOKE_MEMBER, "user456"],
        "messages": [],
        "createdAt": now_millis(),
    });
    let key = chats.add(&payload, None)?;
    println!("   added with key {key}");

    println!("2. Reading the chat back");
    let stored = chats.entry(&key)?.ok_or_else(|| {
        Error::new(ErrorKind::Protocol)
            .with_message("added chat was not readable")
            .with_path(chats.path())
            .with_key(key.clone())
    })?;
    if stored.get("users") != payload.get("users") {
        return Err(Error::new(ErrorKind::Protocol)
            .with_message("added chat came back with different members")
            .with_path(chats.path())
            .with_key(key));
    }
    println!("   ok: {}", compact(&stored.into_value()));

    println!("3. Listing up to 10 chats");
    let listed = chats.list(Some(10))?;
    println!("   {} chat(s)", listed.len());

    println!("4. Querying chats for member '{SMOKE_MEMBER}'");
    let member = chats.query(&Query::new().with_member(SMOKE_MEMBER))?;
    println!("   {} chat(s)", member.len());
    if !member.iter().any(|record| record.key() == key) {
        return Err(Error::new(ErrorKind::Protocol)
            .with_message("membership query missed the added chat")
            .with_path(chats.path())
            .with_key(key));
    }

    println!("5. Querying the chat log at '{}'", chat_log.path());
    let entries = chat_log.query(&Query::new())?;
    println!("   {} entr(ies)", entries.len());

    println!("6. Fetching chat log entry '{SMOKE_ENTRY_KEY}'");
    match chat_log.entry(SMOKE_ENTRY_KEY)? {
        Some(record) => println!("   {}", compact(&record.into_value())),
        None => println!("   not present"),
    }
    Ok(())
}

fn compact(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}

/// Client clock in unix milliseconds.
fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
