//! Agent operations.
//!
//! Each operation is one command/answer exchange on the session. Answers carrying an
//! error code, or a busy answer, become [`Error::Rejected`]. Reservations come in pairs
//! (`reserve_headset`/`free_headset`, `attach_job`/`detach_job`, `avail_work`/
//! `no_further_work`) and the server expects them unwound in reverse order.
use std::collections::BTreeMap;

use crate::{Client, Error, client::Reply, protocol::Command};

pub const LOGON: &str = "AGTLogon";
pub const LOGOFF: &str = "AGTLogoff";
pub const RESERVE_HEADSET: &str = "AGTReserveHeadset";
pub const FREE_HEADSET: &str = "AGTFreeHeadset";
pub const CONNECT_HEADSET: &str = "AGTConnHeadset";
pub const DISCONNECT_HEADSET: &str = "AGTDisconnHeadset";
pub const LIST_JOBS: &str = "AGTListJobs";
pub const ATTACH_JOB: &str = "AGTAttachJob";
pub const DETACH_JOB: &str = "AGTDetachJob";
pub const LIST_STATE: &str = "AGTListState";
pub const SET_DATA_FIELD: &str = "AGTSetDataField";
pub const READ_FIELD: &str = "AGTReadField";
pub const AVAIL_WORK: &str = "AGTAvailWork";
pub const NO_FURTHER_WORK: &str = "AGTNoFurtherWork";
pub const READY_NEXT_ITEM: &str = "AGTReadyNextItem";
pub const RELEASE_LINE: &str = "AGTReleaseLine";
pub const FINISHED_ITEM: &str = "AGTFinishedItem";

/// Notification announcing a call delivered to the agent, with the record's fields.
pub const CALL_NOTIFY: &str = "AGTCallNotify";
/// Notification that the server released the agent's line on its own.
pub const AUTO_RELEASE_LINE: &str = "AGTAutoReleaseLine";

/// Which customer list a data field belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListType {
    Inbound,
    Outbound,
}

impl ListType {
    pub const fn code(self) -> &'static str {
        match self {
            ListType::Inbound => "I",
            ListType::Outbound => "O",
        }
    }
}

/// Which kinds of job [`Client::list_jobs`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFilter {
    All,
    Inbound,
    Outbound,
    Blend,
}

impl JobFilter {
    const fn code(self) -> &'static str {
        match self {
            JobFilter::All => "A",
            JobFilter::Inbound => "I",
            JobFilter::Outbound => "O",
            JobFilter::Blend => "B",
        }
    }
}

impl Client {
    pub fn logon(&self, agent: &str, password: &str) -> Result<(), Error> {
        self.run(Command::new(LOGON).arg(agent).arg(password))
    }

    pub fn logoff(&self) -> Result<(), Error> {
        self.run(Command::new(LOGOFF))
    }

    pub fn reserve_headset(&self, headset_id: u32) -> Result<(), Error> {
        self.run(Command::new(RESERVE_HEADSET).arg(headset_id))
    }

    pub fn free_headset(&self) -> Result<(), Error> {
        self.run(Command::new(FREE_HEADSET))
    }

    pub fn connect_headset(&self) -> Result<(), Error> {
        self.run(Command::new(CONNECT_HEADSET))
    }

    pub fn disconnect_headset(&self) -> Result<(), Error> {
        self.run(Command::new(DISCONNECT_HEADSET))
    }

    /// Job names the server offers, gathered from the data records of the answer.
    pub fn list_jobs(&self, filter: JobFilter) -> Result<Vec<String>, Error> {
        let reply = self.ask(Command::new(LIST_JOBS).arg(filter.code()))?;
        Ok(reply
            .data
            .iter()
            .filter_map(|event| event.payload.status())
            .map(str::to_string)
            .collect())
    }

    pub fn attach_job(&self, job: &str) -> Result<(), Error> {
        self.run(Command::new(ATTACH_JOB).arg(job))
    }

    pub fn detach_job(&self) -> Result<(), Error> {
        self.run(Command::new(DETACH_JOB))
    }

    /// The agent's current state, merged from every field the server reports.
    pub fn list_state(&self) -> Result<BTreeMap<String, String>, Error> {
        let reply = self.ask(Command::new(LIST_STATE))?;
        Ok(collect_fields(&reply))
    }

    /// Asks the server to include `field` in call notifications.
    pub fn set_data_field(&self, list: ListType, field: &str) -> Result<(), Error> {
        self.run(Command::new(SET_DATA_FIELD).arg(list.code()).arg(field))
    }

    /// Reads one field of the current customer record. `None` if the server answered
    /// without a value for it.
    pub fn read_field(&self, list: ListType, field: &str) -> Result<Option<String>, Error> {
        let reply = self.ask(Command::new(READ_FIELD).arg(list.code()).arg(field))?;
        Ok(collect_fields(&reply).remove(field))
    }

    pub fn avail_work(&self) -> Result<(), Error> {
        self.run(Command::new(AVAIL_WORK))
    }

    pub fn no_further_work(&self) -> Result<(), Error> {
        self.run(Command::new(NO_FURTHER_WORK))
    }

    pub fn ready_next_item(&self) -> Result<(), Error> {
        self.run(Command::new(READY_NEXT_ITEM))
    }

    pub fn release_line(&self) -> Result<(), Error> {
        self.run(Command::new(RELEASE_LINE))
    }

    /// Closes the current item with a two-digit completion code.
    pub fn finished_item(&self, completion_code: u8) -> Result<(), Error> {
        self.run(Command::new(FINISHED_ITEM).arg(format!("{completion_code:02}")))
    }

    fn ask(&self, command: Command) -> Result<Reply, Error> {
        self.invoke(&command)?.accepted()
    }

    fn run(&self, command: Command) -> Result<(), Error> {
        self.ask(command).map(|_| ())
    }
}

fn collect_fields(reply: &Reply) -> BTreeMap<String, String> {
    reply
        .data
        .iter()
        .chain(std::iter::once(&reply.event))
        .filter_map(|event| match &event.payload {
            crate::protocol::Payload::Fields(fields) => Some(fields),
            crate::protocol::Payload::Status(_) => None,
        })
        .flat_map(|fields| fields.iter().map(|(k, v)| (k.clone(), v.clone())))
        .collect()
}
