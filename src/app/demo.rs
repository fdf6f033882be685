//! Built-in tasks the console can launch.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail};
use log::info;
use serde_json::json;

use strategy_supervisor::{Message, TaskArgs, TaskFn};

pub const NAMES: [&str; 5] = ["sleep", "fail", "panic", "echo", "spin"];

const TICK: Duration = Duration::from_millis(100);

/// Looks up a demo task by name. `arg` is its single optional argument.
pub fn demo(name: &str, arg: Option<&str>) -> Option<(TaskFn, TaskArgs)> {
    let args = match arg {
        Some(arg) => TaskArgs::new().arg(arg),
        None => TaskArgs::new(),
    };
    let func = match name {
        "sleep" => sleep(),
        "fail" => fail(),
        "panic" => TaskFn::plain(|args| {
            let text: String = args.positional(0).unwrap_or_else(|_| "demo panic".to_string());
            panic!("{}", text)
        }),
        "echo" => echo(),
        "spin" => spin(),
        _ => return None,
    };
    Some((func, args))
}

fn seconds(args: &TaskArgs, default: f64) -> anyhow::Result<Duration> {
    match args.args.first() {
        None => Ok(Duration::from_secs_f64(default)),
        Some(value) => {
            let text = value.as_str().unwrap_or_default();
            let secs: f64 = text
                .parse()
                .map_err(|_| anyhow!("'{}' is not a number of seconds", text))?;
            Duration::try_from_secs_f64(secs)
                .map_err(|e| anyhow!("'{}' is not a usable duration: {}", text, e))
        }
    }
}

/// Sleeps, ending early on SIGTERM or as interrupted on SIGINT.
fn sleep() -> TaskFn {
    TaskFn::with_comm(|args, comm| {
        let total = seconds(args, 5.0)?;
        let started = Instant::now();
        while started.elapsed() < total {
            comm.check_interrupt()?;
            if comm.terminate_requested() {
                info!("Task '{}' leaving early on request.", comm.task_id());
                return Ok(());
            }
            thread::sleep(TICK.min(total.saturating_sub(started.elapsed())));
        }
        Ok(())
    })
}

fn fail() -> TaskFn {
    TaskFn::plain(|args| {
        let reason: String = args
            .positional(0)
            .unwrap_or_else(|_| "demo failure".to_string());
        bail!(reason)
    })
}

/// Echoes every message back; acks `sync`, ends on `stop`.
fn echo() -> TaskFn {
    TaskFn::with_comm(|_, comm| {
        while !comm.terminate_requested() {
            let Some(message) = comm.recv(TICK) else {
                continue;
            };
            match message.kind.as_str() {
                "stop" => break,
                "sync" => {
                    comm.ack();
                }
                _ => {
                    comm.send(Message::new("echo", json!({ "received": message })));
                }
            }
        }
        Ok(())
    })
}

/// Counts in shared state until stopped and raises the event at `arg` ticks.
fn spin() -> TaskFn {
    TaskFn::with_comm(|args, comm| {
        let target: u64 = match args.args.first().and_then(|v| v.as_str()) {
            Some(text) => text
                .parse()
                .map_err(|_| anyhow!("'{}' is not a tick count", text))?,
            None => 10,
        };
        let mut counter: u64 = 0;
        while !comm.terminate_requested() {
            comm.check_interrupt()?;
            counter += 1;
            comm.state().set("counter", counter)?;
            if counter == target {
                comm.event().set();
            }
            thread::sleep(TICK);
        }
        Ok(())
    })
}
