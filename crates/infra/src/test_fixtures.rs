//! A small bank-account domain shared by the crate's tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chronicle_core::{Aggregate, AggregateId, AggregateRoot};
use chronicle_events::payload::{from_payload, to_payload};
use chronicle_events::{CodecError, DecodeEvent, Event, EventCodec, Payload};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opened {
    #[serde(skip)]
    pub recorded_at: DateTime<Utc>,
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposited {
    #[serde(skip)]
    pub recorded_at: DateTime<Utc>,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawn {
    #[serde(skip)]
    pub recorded_at: DateTime<Utc>,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AccountEvent {
    Opened(Opened),
    Deposited(Deposited),
    Withdrawn(Withdrawn),
}

macro_rules! decodable {
    ($ty:ident, $tag:literal, $variant:ident) => {
        impl DecodeEvent for $ty {
            const EVENT_TYPE: &'static str = $tag;

            fn from_payload(payload: Payload, recorded_at: DateTime<Utc>) -> Result<Self, CodecError> {
                let mut ev: $ty = from_payload(Self::EVENT_TYPE, payload)?;
                ev.recorded_at = recorded_at;
                Ok(ev)
            }
        }

        impl From<$ty> for AccountEvent {
            fn from(e: $ty) -> Self {
                AccountEvent::$variant(e)
            }
        }
    };
}

decodable!(Opened, "account.opened", Opened);
decodable!(Deposited, "account.deposited", Deposited);
decodable!(Withdrawn, "account.withdrawn", Withdrawn);

impl Event for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::Opened(_) => Opened::EVENT_TYPE,
            AccountEvent::Deposited(_) => Deposited::EVENT_TYPE,
            AccountEvent::Withdrawn(_) => Withdrawn::EVENT_TYPE,
        }
    }

    fn recorded_at(&self) -> DateTime<Utc> {
        match self {
            AccountEvent::Opened(e) => e.recorded_at,
            AccountEvent::Deposited(e) => e.recorded_at,
            AccountEvent::Withdrawn(e) => e.recorded_at,
        }
    }

    fn to_payload(&self) -> Result<Payload, CodecError> {
        match self {
            AccountEvent::Opened(e) => to_payload(self.event_type(), e),
            AccountEvent::Deposited(e) => to_payload(self.event_type(), e),
            AccountEvent::Withdrawn(e) => to_payload(self.event_type(), e),
        }
    }
}

pub fn codec() -> EventCodec<AccountEvent> {
    EventCodec::new()
        .with::<Opened>()
        .with::<Deposited>()
        .with::<Withdrawn>()
}

pub fn opened(owner: &str) -> AccountEvent {
    Opened {
        recorded_at: Utc::now(),
        owner: owner.to_string(),
    }
    .into()
}

pub fn deposited(amount: i64) -> AccountEvent {
    Deposited {
        recorded_at: Utc::now(),
        amount,
    }
    .into()
}

pub fn withdrawn(amount: i64) -> AccountEvent {
    Withdrawn {
        recorded_at: Utc::now(),
        amount,
    }
    .into()
}

#[derive(Debug, Clone)]
pub enum AccountCommand {
    Open { owner: String },
    Deposit { amount: i64 },
    Withdraw { amount: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountError {
    AlreadyOpen,
    NotOpen,
    InvalidAmount,
    InsufficientFunds { balance: i64, requested: i64 },
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: AggregateId,
    pub version: u64,
    pub owner: Option<String>,
    pub balance: i64,
}

impl Account {
    pub fn empty(id: AggregateId) -> Self {
        Self {
            id,
            version: 0,
            owner: None,
            balance: 0,
        }
    }
}

impl AggregateRoot for Account {
    fn id(&self) -> &AggregateId {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Aggregate for Account {
    type Command = AccountCommand;
    type Event = AccountEvent;
    type Error = AccountError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            AccountEvent::Opened(e) => self.owner = Some(e.owner.clone()),
            AccountEvent::Deposited(e) => self.balance += e.amount,
            AccountEvent::Withdrawn(e) => self.balance -= e.amount,
        }
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            AccountCommand::Open { owner } => {
                if self.owner.is_some() {
                    return Err(AccountError::AlreadyOpen);
                }
                Ok(vec![opened(owner)])
            }
            AccountCommand::Deposit { amount } => {
                if self.owner.is_none() {
                    return Err(AccountError::NotOpen);
                }
                if *amount <= 0 {
                    return Err(AccountError::InvalidAmount);
                }
                Ok(vec![deposited(*amount)])
            }
            AccountCommand::Withdraw { amount } => {
                if self.owner.is_none() {
                    return Err(AccountError::NotOpen);
                }
                if *amount > self.balance {
                    return Err(AccountError::InsufficientFunds {
                        balance: self.balance,
                        requested: *amount,
                    });
                }
                Ok(vec![withdrawn(*amount)])
            }
        }
    }
}
