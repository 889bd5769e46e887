//! CLI utilities for apc.
//!
//! [`run`] drives one agent through a working session the way a softphone would: it
//! logs on, claims a headset and a job, then works calls as the server announces them
//! until it is interrupted or the connection drops. Every reservation is undone on the
//! way out, in reverse order, even when a later step fails.
use std::{io::Write, time::Duration};

use clap::Parser;
use crossbeam::channel::Receiver;
use log::{debug, error, info, warn};

use crate::{
    Client, ClientOptions, Error, Security,
    agent::{AUTO_RELEASE_LINE, CALL_NOTIFY, ListType},
    protocol::{Event, Notifications},
};

/// Completion code reported for items whose line the server released on its own.
pub const AUTO_RELEASE_COMPLETION: u8 = 22;

#[derive(Debug, Parser)]
#[command(version, about = "Work calls as a Proactive Contact agent", long_about = None)]
pub struct Cli {
    /// Server address as HOST:PORT
    #[arg(long)]
    pub addr: String,
    /// Agent name to log on with
    #[arg(long)]
    pub agent_name: String,
    #[arg(long)]
    pub password: String,
    /// Headset to reserve for the session
    #[arg(long)]
    pub headset_id: u32,
    /// Job to attach to
    #[arg(long)]
    pub job_name: String,
    /// Give up on a command after this many seconds; the session stays open
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
    /// Close the session when the server sends nothing for this many seconds
    #[arg(long, value_name = "SECS")]
    pub read_timeout: Option<u64>,
    /// Connect over plain TCP instead of TLS
    #[arg(long)]
    pub plain: bool,
}

impl Cli {
    pub fn security(&self) -> Security {
        if self.plain { Security::Plain } else { Security::Tls }
    }

    pub fn options(&self) -> ClientOptions {
        let mut options = ClientOptions::default().with_client_name("apcctl");
        if let Some(secs) = self.timeout {
            options = options.with_command_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.read_timeout {
            options = options.with_read_timeout(Duration::from_secs(secs));
        }
        options
    }
}

type Undo = fn(&Client) -> Result<(), Error>;

/// Reservations to give back, undone last-in first-out when dropped.
struct Teardown<'a> {
    client: &'a Client,
    steps: Vec<(&'static str, Undo)>,
}

impl<'a> Teardown<'a> {
    fn new(client: &'a Client) -> Self {
        Self {
            client,
            steps: Vec::new(),
        }
    }

    fn push(&mut self, name: &'static str, undo: Undo) {
        self.steps.push((name, undo));
    }
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        while let Some((name, undo)) = self.steps.pop() {
            match undo(self.client) {
                Ok(()) => debug!("{name} done"),
                Err(e) => error!("{name} failed: {e}"),
            }
        }
    }
}

/// Runs an agent session until `interrupt` fires or the server goes away. Phone numbers
/// of delivered calls are written to `out`, one per line.
pub fn run<W: Write>(cli: &Cli, interrupt: &Receiver<()>, out: &mut W) -> Result<(), Error> {
    let client = Client::connect(&cli.addr, cli.security(), cli.options())?;
    let notifications = client.notifications();

    {
        let mut teardown = Teardown::new(&client);

        client.logon(&cli.agent_name, &cli.password)?;
        teardown.push("logoff", Client::logoff);

        client.reserve_headset(cli.headset_id)?;
        teardown.push("free headset", Client::free_headset);

        client.connect_headset()?;
        teardown.push("disconnect headset", Client::disconnect_headset);

        client.attach_job(&cli.job_name)?;
        teardown.push("detach job", Client::detach_job);

        let state = client.list_state()?;
        debug!("agent state: {state:?}");

        client.set_data_field(ListType::Outbound, "DEBT_ID")?;
        client.set_data_field(ListType::Outbound, "CURPHONE")?;

        client.avail_work()?;
        teardown.push("no further work", Client::no_further_work);

        if let Err(e) = client.ready_next_item() {
            warn!("ready for next item: {e}");
        }
        info!("{} working job {}", cli.agent_name, cli.job_name);

        work(&client, &notifications, interrupt, out)?;
    }

    info!("session ended: {}", client.close());
    Ok(())
}

fn work<W: Write>(
    client: &Client,
    notifications: &Notifications,
    interrupt: &Receiver<()>,
    out: &mut W,
) -> Result<(), Error> {
    loop {
        crossbeam::select! {
            recv(interrupt) -> _ => {
                info!("interrupted, shutting down");
                return Ok(());
            }
            recv(notifications.receiver()) -> event => match event {
                Ok(event) => handle(client, &event, out)?,
                Err(_) => {
                    warn!("notification channel closed");
                    return Ok(());
                }
            },
        }
    }
}

fn handle<W: Write>(client: &Client, event: &Event, out: &mut W) -> Result<(), Error> {
    match event.keyword.as_str() {
        CALL_NOTIFY => {
            let Some(slot) = event.payload.field("CURPHONE") else {
                return Ok(());
            };
            let slot: u32 = match slot.parse() {
                Ok(slot) => slot,
                Err(e) => {
                    warn!("bad CURPHONE '{slot}': {e}");
                    return Ok(());
                }
            };
            match client.read_field(ListType::Outbound, &format!("PHONE_ID{slot}")) {
                Ok(Some(phone)) => writeln!(out, "{phone}")?,
                Ok(None) => warn!("no PHONE_ID{slot} on the current record"),
                Err(e) => error!("read PHONE_ID{slot}: {e}"),
            }
        }
        AUTO_RELEASE_LINE => {
            if let Err(e) = client.release_line() {
                error!("release line: {e}");
            }
            if let Err(e) = client.finished_item(AUTO_RELEASE_COMPLETION) {
                error!("finish item: {e}");
            }
            if let Err(e) = client.ready_next_item() {
                error!("ready for next item: {e}");
            }
        }
        _ => debug!("ignoring {event}"),
    }
    Ok(())
}
