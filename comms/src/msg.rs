use std::{borrow::Cow, io};

use crate::{
    Deserialize, Serialize,
    specs::edge::{LocalTrainResult, LocalTrainSpec},
};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR_H: Header = 0;
const CONTROL_H: Header = 1;

/// The command for the `Control` variant of the `Msg` enum.
///
/// The first four are served by edge nodes, `LocalTrainFinish` is served by the operator
/// and `Ack` is the positive reply to any of them.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    TrainInit,
    LocalTrain(LocalTrainSpec),
    TrainInterrupt,
    TrainFinish,
    LocalTrainFinish(LocalTrainResult),
    Ack,
    Disconnect,
}

impl Command {
    /// A short name of the command for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::TrainInit => "train_init",
            Command::LocalTrain(_) => "local_train",
            Command::TrainInterrupt => "train_interrupt",
            Command::TrainFinish => "train_finish",
            Command::LocalTrainFinish(_) => "local_train_finish",
            Command::Ack => "ack",
            Command::Disconnect => "disconnect",
        }
    }
}

/// The application layer message for the entire system.
#[derive(Debug, PartialEq)]
pub enum Msg<'a> {
    Control(Command),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind_byte<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind header {kind}"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR_H.to_be_bytes());
                Some(e.as_bytes())
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL_H.to_be_bytes());

                // SAFETY: Serialize impl for `Command` is derived and not implemented
                //         by hand. Its only map has string keys and writing into a
                //         `Vec` never fails.
                serde_json::to_writer(buf, cmd).unwrap();
                None
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (kind_buf, rest) = buf.split_at(HEADER_SIZE);

        // SAFETY: We splitted the buffer to be of size `HEADER_SIZE` just above.
        let kind = Header::from_be_bytes(kind_buf.try_into().unwrap());

        match kind {
            ERR_H => {
                let string = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL_H => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            kind => Self::invalid_kind_byte(kind),
        }
    }
}
