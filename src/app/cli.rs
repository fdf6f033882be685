use std::{
    io::{self, Write},
    time::Duration,
};

use crossterm::{
    cursor,
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal,
};
use serde_json::Value;

use strategy_supervisor::{Message, TaskManager, TaskRecord};

use crate::app::demo;

const RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, PartialEq)]
pub enum Command {
    Start { task_id: String, demo: String, arg: Option<String> },
    Stop(String),
    Kill(String),
    Send { task_id: String, kind: String, payload: Value },
    Recv(String),
    Get { task_id: String, key: String },
    Set { task_id: String, key: String, value: Value },
    Status(String),
    List,
    Help,
    Exit,
}

impl Command {
    /// Parses one console line. `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Command>, String> {
        let mut args = line.split_whitespace();
        let Some(command) = args.next() else {
            return Ok(None);
        };
        let mut required = |what: &str| {
            args.next()
                .map(str::to_string)
                .ok_or_else(|| format!("{} must be specified.", what))
        };

        let parsed = match command {
            "start" => Command::Start {
                task_id: required("Task ID")?,
                demo: required("Demo name")?,
                arg: required("").ok(),
            },
            "stop" => Command::Stop(required("Task ID")?),
            "kill" => Command::Kill(required("Task ID")?),
            "send" => {
                let task_id = required("Task ID")?;
                let kind = required("Message type")?;
                Command::Send { task_id, kind, payload: json_rest(line, 3)?.unwrap_or(Value::Null) }
            }
            "recv" => Command::Recv(required("Task ID")?),
            "get" => Command::Get { task_id: required("Task ID")?, key: required("Key")? },
            "set" => {
                let task_id = required("Task ID")?;
                let key = required("Key")?;
                let value = json_rest(line, 3)?.ok_or_else(|| "Value must be specified.".to_string())?;
                Command::Set { task_id, key, value }
            }
            "status" => Command::Status(required("Task ID")?),
            "list" => Command::List,
            "help" => Command::Help,
            "exit" => Command::Exit,
            other => return Err(format!("Unknown command: {}. Please try again.", other)),
        };
        Ok(Some(parsed))
    }
}

/// Everything after the first `skip` words, parsed as JSON.
fn json_rest(line: &str, skip: usize) -> Result<Option<Value>, String> {
    let mut rest = line.trim_start();
    for _ in 0..skip {
        rest = rest
            .split_once(char::is_whitespace)
            .map_or("", |(_, tail)| tail.trim_start());
    }
    let rest = rest.trim();
    if rest.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(rest)
        .map(Some)
        .map_err(|e| format!("Invalid JSON '{}': {}", rest, e))
}

pub fn run_cli(manager: &TaskManager) -> io::Result<()> {
    println!("Strategy supervisor started. Enter a command, 'help' for a list, or 'exit' to quit.");
    let mut commands_history: Vec<String> = Vec::new();
    let mut history_index = 0;

    terminal::enable_raw_mode()?;
    let result = (|| -> io::Result<()> {
        loop {
            let Some(input) = read_line(&commands_history, &mut history_index)? else {
                say("Exiting the program...");
                return Ok(());
            };
            if !input.trim().is_empty() {
                commands_history.push(input.clone());
            }
            history_index = commands_history.len();

            match Command::parse(&input) {
                Ok(Some(Command::Exit)) => {
                    say("Exiting the program...");
                    return Ok(());
                }
                Ok(Some(command)) => execute_command(manager, command),
                Ok(None) => {}
                Err(message) => say(&message),
            }
        }
    })();
    terminal::disable_raw_mode()?;
    result
}

/// Reads one line with history navigation. `None` on Ctrl+C or Ctrl+D.
fn read_line(history: &[String], history_index: &mut usize) -> io::Result<Option<String>> {
    print!("\r>>> ");
    io::stdout().flush()?;

    let mut input = String::new();
    loop {
        let Event::Key(key_event) = event::read()? else {
            continue;
        };
        if key_event.kind != KeyEventKind::Press {
            continue;
        }
        match key_event.code {
            KeyCode::Char('c') | KeyCode::Char('d')
                if key_event.modifiers.contains(KeyModifiers::CONTROL) =>
            {
                println!();
                return Ok(None);
            }
            KeyCode::Enter => {
                println!();
                return Ok(Some(input));
            }
            KeyCode::Up => {
                if *history_index > 0 {
                    *history_index -= 1;
                }
                if let Some(command) = history.get(*history_index) {
                    input = command.clone();
                    redraw(&input)?;
                }
            }
            KeyCode::Down => {
                if *history_index < history.len() {
                    *history_index += 1;
                }
                input = history.get(*history_index).cloned().unwrap_or_default();
                redraw(&input)?;
            }
            KeyCode::Char(c) => {
                input.push(c);
                print!("{}", c);
                io::stdout().flush()?;
            }
            KeyCode::Backspace => {
                input.pop();
                redraw(&input)?;
            }
            _ => {}
        }
    }
}

fn redraw(input: &str) -> io::Result<()> {
    execute!(
        io::stdout(),
        cursor::MoveToColumn(0),
        terminal::Clear(terminal::ClearType::CurrentLine)
    )?;
    print!(">>> {}", input);
    io::stdout().flush()
}

// Raw mode needs an explicit carriage return on every line.
fn say(text: &str) {
    for line in text.lines() {
        println!("\r{}", line);
    }
}

fn execute_command(manager: &TaskManager, command: Command) {
    match command {
        Command::Start { task_id, demo, arg } => match demo::demo(&demo, arg.as_deref()) {
            Some((func, args)) => {
                if manager.start(&task_id, func, args) {
                    say(&format!("Started task {} running '{}'.", task_id, demo));
                    say(&format!("Use `status {}` to check the status", task_id));
                } else {
                    say(&format!("Task {} was not started, see the log.", task_id));
                }
            }
            None => say(&format!(
                "Unknown demo '{}'. Available: {}",
                demo,
                demo::NAMES.join(", ")
            )),
        },
        Command::Stop(task_id) => {
            if manager.stop(&task_id, manager.config().stop_timeout) {
                say(&format!("Task {} stopped.", task_id));
            } else {
                say(&format!("Task {} not found", task_id));
            }
        }
        Command::Kill(task_id) => kill(manager, &task_id),
        Command::Send { task_id, kind, payload } => {
            if manager.send(&task_id, Message::new(kind, payload)) {
                say(&format!("Sent message to task {}", task_id));
            } else {
                say(&format!("Could not send to task {}", task_id));
            }
        }
        Command::Recv(task_id) => match manager.receive(&task_id, RECEIVE_TIMEOUT) {
            Some(message) => say(&format!("\t{}: {}", message.kind, message.payload)),
            None => say(&format!("No message from task {}", task_id)),
        },
        Command::Get { task_id, key } => match manager.shared_get(&task_id, &key) {
            Ok(Some(value)) => say(&format!("\t{} = {}", key, value)),
            Ok(None) => say(&format!("\t{} is not set", key)),
            Err(e) => say(&format!("Error: {}", e)),
        },
        Command::Set { task_id, key, value } => match manager.shared_set(&task_id, &key, value) {
            Ok(()) => say(&format!("\t{} updated", key)),
            Err(e) => say(&format!("Error: {}", e)),
        },
        Command::Status(task_id) => match manager.status(&task_id) {
            Some(record) => print_record(&record),
            None => say(&format!("Task {} not found", task_id)),
        },
        Command::List => {
            let tasks = manager.status_all();
            if tasks.is_empty() {
                say("No tasks");
            } else {
                say("\tTask list:");
                say(&format!("{:<16} {:<12} {:<8} {}", "ID", "Status", "PID", "Exit"));
                say(&"-".repeat(48));
                for task in tasks {
                    say(&format!(
                        "{:<16} {:<12} {:<8} {}",
                        task.task_id,
                        task.status,
                        optional(task.pid),
                        optional(task.exit_code)
                    ));
                }
            }
        }
        Command::Help => say(
            "start <id> <demo> [arg]   demos: sleep, fail, panic, echo, spin\n\
             stop <id> | kill <id> | status <id> | list\n\
             send <id> <type> [json] | recv <id>\n\
             get <id> <key> | set <id> <key> <json>\n\
             exit",
        ),
        Command::Exit => {}
    }
}

/// Sends SIGKILL straight to the worker, bypassing `stop`.
fn kill(manager: &TaskManager, task_id: &str) {
    let Some(pid) = manager.status(task_id).and_then(|record| record.pid) else {
        say(&format!("Task {} has no process", task_id));
        return;
    };
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    if rc == 0 {
        say(&format!("Sent kill signal to task {} (pid {})", task_id, pid));
    } else {
        say(&format!("Failed to kill task {}: {}", task_id, io::Error::last_os_error()));
    }
}

fn print_record(record: &TaskRecord) {
    say(&format!("Task {} status: {}", record.task_id, record.status));
    say(&format!("\tpid: {}", optional(record.pid)));
    say(&format!("\tstarted: {}", record.start_time.format("%Y-%m-%d %H:%M:%S")));
    if let Some(end) = record.end_time {
        say(&format!("\tended: {}", end.format("%Y-%m-%d %H:%M:%S")));
    }
    say(&format!("\texit code: {}", optional(record.exit_code)));
    if let Some(error) = &record.error {
        say(&format!("\terror: {}", error));
    }
    if let Some(traceback) = &record.traceback {
        say(traceback);
    }
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "NONE".to_string(), |v| v.to_string())
}
