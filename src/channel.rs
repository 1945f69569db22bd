/// One ANT channel as seen from the host. A channel walks the configuration
/// handshake one command at a time (assign, channel id, search timeout, period,
/// frequency, open), then searches until the first broadcast pairs it with a
/// device. Closing is a handshake too: close, wait for the radio to report the
/// channel closed, then unassign. The channel number is free again only once
/// the radio has unassigned it.
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::message::{self, Message};
use crate::response::{ChannelId, ChannelResponseCode};

/// Radio side channel parameters. Fixed once the channel is opened; a new
/// configuration needs a new channel.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    device_number: u16,
    device_type: u8,
    channel_type: u8,
    frequency: u8,
    period: u16,
    search_timeout: u8,
    transmission_type: u8,
    search_retries: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Config {
            device_number: 0,
            device_type: 0,
            channel_type: 0x00,
            frequency: 57,
            period: 8192,
            search_timeout: 10,
            transmission_type: 0,
            search_retries: 0,
        }
    }

    pub fn device_number(mut self, device_number: u16) -> Self {
        self.device_number = device_number;
        self
    }

    pub fn device_type(mut self, device_type: u8) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn channel_type(mut self, channel_type: u8) -> Self {
        self.channel_type = channel_type;
        self
    }

    pub fn frequency(mut self, frequency: u8) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn period(mut self, period: u16) -> Self {
        self.period = period;
        self
    }

    /// Search timeout in 2.5 second units.
    pub fn search_timeout(mut self, timeout: u8) -> Self {
        self.search_timeout = timeout;
        self
    }

    pub fn transmission_type(mut self, transmission_type: u8) -> Self {
        self.transmission_type = transmission_type;
        self
    }

    /// How many times to search again after a search timeout.
    pub fn search_retries(mut self, retries: u8) -> Self {
        self.search_retries = retries;
        self
    }

    pub fn get_device_number(&self) -> u16 {
        self.device_number
    }

    pub fn get_device_type(&self) -> u8 {
        self.device_type
    }

    pub fn get_transmission_type(&self) -> u8 {
        self.transmission_type
    }

    pub fn get_frequency(&self) -> u8 {
        self.frequency
    }

    pub fn get_period(&self) -> u16 {
        self.period
    }

    /// The messaging period as wall time. Periods are counted in 1/32768 s.
    pub fn period_duration(&self) -> Duration {
        Duration::from_micros(self.period as u64 * 1_000_000 / 32768)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unassigned,
    Assigned,
    Searching,
    Tracking,
    Closed,
    Error,
}

/// Notable transitions, reported on the output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Searching,
    Tracking,
    SearchTimeout,
    SignalLost,
    Closed,
    Error,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelFault {
    #[error("channel {channel}: unexpected {what} in state {state:?}")]
    ProtocolViolation {
        channel: u8,
        state: ChannelState,
        what: String,
    },

    #[error("channel {channel}: command 0x{command_id:02X} rejected with {code:?}")]
    CommandRejected {
        channel: u8,
        command_id: u8,
        code: ChannelResponseCode,
    },

    #[error("channel {channel}: no response to command 0x{command_id:02X} after {attempts} attempts")]
    CommandTimeout {
        channel: u8,
        command_id: u8,
        attempts: u8,
    },
}

/// What the session has to do after the channel handled an input.
#[derive(Debug, Default, PartialEq)]
pub struct Outcome {
    pub command: Option<Message>,
    pub status: Option<ChannelStatus>,
}

impl Outcome {
    fn command(command: Message) -> Self {
        Outcome {
            command: Some(command),
            status: None,
        }
    }

    fn status(status: ChannelStatus) -> Self {
        Outcome {
            command: None,
            status: Some(status),
        }
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum Step {
    Assign,
    SetChannelId,
    SetSearchTimeout,
    SetPeriod,
    SetFrequency,
    Open,
    Close,
    Unassign,
}

impl Step {
    fn command_id(self) -> u8 {
        match self {
            Step::Assign => message::MESG_ASSIGN_CHANNEL_ID,
            Step::SetChannelId => message::MESG_CHANNEL_ID_ID,
            Step::SetSearchTimeout => message::MESG_CHANNEL_SEARCH_TIMEOUT_ID,
            Step::SetPeriod => message::MESG_CHANNEL_MESG_PERIOD_ID,
            Step::SetFrequency => message::MESG_CHANNEL_RADIO_FREQ_ID,
            Step::Open => message::MESG_OPEN_CHANNEL_ID,
            Step::Close => message::MESG_CLOSE_CHANNEL_ID,
            Step::Unassign => message::MESG_UNASSIGN_CHANNEL_ID,
        }
    }
}

/// Channel maintains the channel number, state of the channel, and the device
/// for the channel configuration parameters.
#[derive(Debug, Clone)]
pub struct Channel {
    number: u8,
    network: u8,
    config: Config,
    state: ChannelState,
    awaiting: Option<Step>,
    last_broadcast: Option<Instant>,
    paired: Option<ChannelId>,
    // What the radio holds for this number, independent of `state`.
    radio_assigned: bool,
    radio_open: bool,
    closing: bool,
    retries_left: u8,
}

impl Channel {
    pub fn new(number: u8, network: u8, config: Config) -> Self {
        Channel {
            number,
            network,
            retries_left: config.search_retries,
            config,
            state: ChannelState::Unassigned,
            awaiting: None,
            last_broadcast: None,
            paired: None,
            radio_assigned: false,
            radio_open: false,
            closing: false,
        }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A command for this channel is waiting on its response.
    pub fn is_busy(&self) -> bool {
        self.awaiting.is_some()
    }

    /// Unassigned on the radio side as well, so the number can be reused.
    pub fn is_released(&self) -> bool {
        !self.radio_assigned
            && !self.radio_open
            && !self.is_busy()
            && matches!(
                self.state,
                ChannelState::Unassigned | ChannelState::Closed | ChannelState::Error
            )
    }

    /// A close was requested and the radio side is not torn down yet.
    pub fn is_closing(&self) -> bool {
        self.closing && !self.is_released()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ChannelState::Closed | ChannelState::Error)
    }

    /// Identity of the paired device, once the radio reported it.
    pub fn paired(&self) -> Option<ChannelId> {
        self.paired
    }

    pub fn set_paired(&mut self, id: ChannelId) {
        self.paired = Some(id);
    }

    /// Assigns the channel to the network. Only valid from `Unassigned`.
    pub fn assign(&mut self) -> Result<Message, ChannelFault> {
        if self.state != ChannelState::Unassigned || self.is_busy() {
            return Err(self.violation("assign"));
        }
        self.awaiting = Some(Step::Assign);
        Ok(message::assign_channel(
            self.number,
            self.config.channel_type,
            self.network,
        ))
    }

    /// Handles the response to the command this channel sent last. A
    /// successful response yields the next configuration command.
    pub fn on_response(
        &mut self,
        command_id: u8,
        code: ChannelResponseCode,
    ) -> Result<Outcome, ChannelFault> {
        let step = match self.awaiting {
            Some(step) if step.command_id() == command_id => step,
            _ => return Err(self.violation(&format!("response to 0x{:02X}", command_id))),
        };
        self.awaiting = None;

        if code != ChannelResponseCode::ResponseNoError {
            // The radio may have closed or released the channel on its own.
            match step {
                Step::Close => {
                    log::debug!("Channel {} close answered {:?}", self.number, code);
                    self.radio_open = false;
                    return Ok(self.on_closed());
                }
                Step::Unassign if self.closing => {
                    log::debug!("Channel {} unassign answered {:?}", self.number, code);
                    self.radio_assigned = false;
                    return Ok(self.finish_close());
                }
                _ => {}
            }
            self.state = ChannelState::Error;
            return Err(ChannelFault::CommandRejected {
                channel: self.number,
                command_id,
                code,
            });
        }

        match step {
            Step::Assign => self.radio_assigned = true,
            Step::Open => self.radio_open = true,
            _ => {}
        }
        if self.closing && step != Step::Close && step != Step::Unassign {
            return Ok(self.teardown());
        }

        let outcome = match step {
            Step::Assign => {
                log::debug!("Channel {} assigned, setting channel id", self.number);
                self.state = ChannelState::Assigned;
                self.next(Step::SetChannelId)
            }
            Step::SetChannelId => self.next(Step::SetSearchTimeout),
            Step::SetSearchTimeout => self.next(Step::SetPeriod),
            Step::SetPeriod => self.next(Step::SetFrequency),
            Step::SetFrequency => self.next(Step::Open),
            Step::Open => {
                log::info!("Channel {} is open, searching", self.number);
                self.state = ChannelState::Searching;
                self.last_broadcast = None;
                Outcome::status(ChannelStatus::Searching)
            }
            Step::Close => self.on_closed(),
            Step::Unassign => {
                self.radio_assigned = false;
                if self.closing {
                    self.finish_close()
                } else if self.retries_left > 0 {
                    self.retries_left -= 1;
                    log::info!(
                        "Channel {} searching again, {} retries left",
                        self.number,
                        self.retries_left
                    );
                    self.state = ChannelState::Unassigned;
                    Outcome::command(self.assign()?)
                } else {
                    self.state = ChannelState::Unassigned;
                    Outcome::default()
                }
            }
        };
        Ok(outcome)
    }

    /// Handles an asynchronous channel event from the radio.
    pub fn on_event(&mut self, code: ChannelResponseCode) -> Outcome {
        match (code, self.state) {
            (ChannelResponseCode::EventRxSearchTimeout, ChannelState::Searching) => {
                log::warn!("Channel {} search timed out", self.number);
                self.state = ChannelState::Unassigned;
                Outcome::status(ChannelStatus::SearchTimeout)
            }
            (ChannelResponseCode::EventRxFailGoToSearch, ChannelState::Tracking) => {
                log::warn!("Channel {} lost its device, searching", self.number);
                self.state = ChannelState::Searching;
                self.last_broadcast = None;
                Outcome::status(ChannelStatus::SignalLost)
            }
            (ChannelResponseCode::EventChannelClosed, state) => {
                self.radio_open = false;
                if self.is_busy() {
                    // The close response, if that is what we wait on, does the rest.
                    return Outcome::default();
                }
                let mut outcome = Outcome::default();
                if matches!(state, ChannelState::Searching | ChannelState::Tracking) {
                    log::warn!("Channel {} closed by the radio", self.number);
                    self.closing = true;
                    self.state = ChannelState::Closed;
                    outcome.status = Some(ChannelStatus::Closed);
                }
                if self.radio_assigned && (self.closing || self.state == ChannelState::Unassigned)
                {
                    self.awaiting = Some(Step::Unassign);
                    outcome.command = Some(message::unassign_channel(self.number));
                }
                outcome
            }
            (ChannelResponseCode::EventRxFail, _) | (ChannelResponseCode::ChannelCollision, _) => {
                log::trace!("Channel {} event {:?}", self.number, code);
                Outcome::default()
            }
            _ => {
                log::debug!(
                    "Channel {} ignoring event {:?} in state {:?}",
                    self.number,
                    code,
                    self.state
                );
                Outcome::default()
            }
        }
    }

    /// Broadcast data arrived for this channel.
    pub fn on_broadcast(&mut self, now: Instant) -> Result<Outcome, ChannelFault> {
        match self.state {
            ChannelState::Searching => {
                log::info!("Channel {} is tracking", self.number);
                self.state = ChannelState::Tracking;
                self.last_broadcast = Some(now);
                let mut outcome = Outcome::status(ChannelStatus::Tracking);
                if self.config.device_number == 0 && self.paired.is_none() {
                    outcome.command = Some(message::get_channel_id(self.number));
                }
                Ok(outcome)
            }
            ChannelState::Tracking => {
                self.last_broadcast = Some(now);
                Ok(Outcome::default())
            }
            _ => Err(self.violation("broadcast data")),
        }
    }

    /// Moves a tracking channel back to searching when no broadcast arrived
    /// within `periods` messaging periods.
    pub fn check_signal(&mut self, now: Instant, periods: u32) -> Outcome {
        if self.state != ChannelState::Tracking {
            return Outcome::default();
        }
        let limit = self.config.period_duration() * periods;
        match self.last_broadcast {
            Some(last) if now.saturating_duration_since(last) > limit => {
                log::warn!(
                    "Channel {} heard nothing for {:?}, searching",
                    self.number,
                    limit
                );
                self.state = ChannelState::Searching;
                self.last_broadcast = None;
                Outcome::status(ChannelStatus::SignalLost)
            }
            _ => Outcome::default(),
        }
    }

    /// Closes the channel and releases it on the radio. `in_flight` tells
    /// whether the command this channel waits on was already sent; a command
    /// that never left the host is forgotten. Otherwise the teardown starts
    /// once its answer arrives.
    pub fn close(&mut self, in_flight: bool) -> Outcome {
        if !in_flight {
            self.awaiting = None;
        }
        if self.closing && self.is_busy() {
            return Outcome::default();
        }
        self.closing = true;
        if self.is_busy() {
            return Outcome::default();
        }
        self.teardown()
    }

    /// Moves the channel to the terminal error state.
    pub fn fail(&mut self) -> Outcome {
        self.awaiting = None;
        self.closing = false;
        if self.state == ChannelState::Error {
            return Outcome::default();
        }
        self.state = ChannelState::Error;
        Outcome::status(ChannelStatus::Error)
    }

    /// The radio dropped everything, e.g. after a reset.
    pub fn radio_lost(&mut self) {
        self.awaiting = None;
        self.radio_assigned = false;
        self.radio_open = false;
    }

    fn teardown(&mut self) -> Outcome {
        if self.radio_open && self.state == ChannelState::Closed {
            // Close acknowledged, waiting on the radio's closed event.
            Outcome::default()
        } else if self.radio_open {
            self.awaiting = Some(Step::Close);
            Outcome::command(message::close_channel(self.number))
        } else if self.radio_assigned {
            self.awaiting = Some(Step::Unassign);
            Outcome::command(message::unassign_channel(self.number))
        } else {
            self.finish_close()
        }
    }

    // Close acknowledged. The radio reports the channel closed separately,
    // unassigning has to wait for that.
    fn on_closed(&mut self) -> Outcome {
        let mut outcome = self.finish_close();
        if !self.radio_open && self.radio_assigned {
            self.awaiting = Some(Step::Unassign);
            outcome.command = Some(message::unassign_channel(self.number));
        }
        outcome
    }

    fn finish_close(&mut self) -> Outcome {
        match self.state {
            ChannelState::Closed | ChannelState::Error => Outcome::default(),
            _ => {
                self.state = ChannelState::Closed;
                log::info!("Channel {} closed", self.number);
                Outcome::status(ChannelStatus::Closed)
            }
        }
    }

    fn next(&mut self, step: Step) -> Outcome {
        self.awaiting = Some(step);
        let command = match step {
            Step::SetChannelId => message::set_channel_id(
                self.number,
                self.config.device_number,
                self.config.device_type,
                self.config.transmission_type,
            ),
            Step::SetSearchTimeout => {
                message::set_hp_search_timeout(self.number, self.config.search_timeout)
            }
            Step::SetPeriod => message::set_channel_period(self.number, self.config.period),
            Step::SetFrequency => {
                message::set_channel_frequency(self.number, self.config.frequency)
            }
            Step::Open => message::open_channel(self.number),
            Step::Assign => {
                message::assign_channel(self.number, self.config.channel_type, self.network)
            }
            Step::Close => message::close_channel(self.number),
            Step::Unassign => message::unassign_channel(self.number),
        };
        Outcome::command(command)
    }

    fn violation(&self, what: &str) -> ChannelFault {
        ChannelFault::ProtocolViolation {
            channel: self.number,
            state: self.state,
            what: what.to_string(),
        }
    }
}
