/// The session owns the radio. It brings the radio up (reset, capabilities,
/// network key), opens a channel per configured device and then runs a single
/// threaded read loop that routes every decoded frame to the channel it belongs
/// to. Only one command is ever in flight; everything else waits in the
/// outbound queue until the radio has answered.
use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::time::Instant;

use crossbeam_channel::{Receiver, TryRecvError};
use log::{debug, error, info, trace, warn};

use super::Result;
use crate::{
    channel::{self, Channel, ChannelFault, ChannelState, ChannelStatus, Outcome},
    codec::FrameDecoder,
    config::{Settings, Timing},
    device::{Device, Measurement},
    error::AntError,
    message::{
        self, Message, MESG_CAPABILITIES_ID, MESG_CHANNEL_ID_ID, MESG_REQUEST, MESG_RESET,
    },
    output::{DeviceIdentity, Emitter, SessionEnd},
    response::{
        classify, BroadcastData, Capabilities, ChannelId, ChannelResponseCode, Response,
        StartupReason,
    },
    usb::Transport,
};

/// Control requests accepted while the session runs. Dropping every sender
/// stops the session the same way `Quit` does.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Opens a channel. A number the radio still holds from an earlier
    /// channel is closed and unassigned first.
    OpenChannel(u8, channel::Config),
    CloseChannel(u8),
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Reset,
    Capabilities,
    NetworkKey,
    Running,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Owner {
    Radio,
    Channel(u8),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Expect {
    Startup,
    Capabilities,
    ChannelId(u8),
    Response { channel: u8, command_id: u8 },
}

impl Expect {
    fn of(mesg: &Message) -> Expect {
        match (mesg.id, mesg.data.get(1).copied()) {
            (MESG_RESET, _) => Expect::Startup,
            (MESG_REQUEST, Some(MESG_CAPABILITIES_ID)) => Expect::Capabilities,
            (MESG_REQUEST, Some(MESG_CHANNEL_ID_ID)) => Expect::ChannelId(mesg.data[0]),
            // The network key response carries the network number where
            // channel commands carry the channel.
            _ => Expect::Response {
                channel: mesg.data.first().copied().unwrap_or(0),
                command_id: mesg.id,
            },
        }
    }
}

/// The command currently waiting on the radio.
#[derive(Debug)]
struct PendingRequest {
    expect: Expect,
    owner: Owner,
    message: Message,
    sent_at: Instant,
    retries: u8,
}

struct Slot {
    channel: Channel,
    device: Device,
}

impl Slot {
    fn identity(&self) -> DeviceIdentity {
        match self.channel.paired() {
            Some(id) => id.into(),
            None => self.channel.config().into(),
        }
    }
}

pub struct Session<T: Transport, W: Write> {
    transport: T,
    timing: Timing,
    network: u8,
    network_key: [u8; 8],
    new_beats_only: bool,
    state: State,
    decoder: FrameDecoder,
    slots: BTreeMap<u8, Slot>,
    startup_channels: Vec<(u8, channel::Config)>,
    // Opens waiting for the radio to release the channel number.
    reopen: BTreeMap<u8, channel::Config>,
    outbound: VecDeque<(Owner, Message)>,
    pending: Option<PendingRequest>,
    requests: Receiver<Request>,
    emitter: Emitter<W>,
    capabilities: Option<Capabilities>,
}

impl<T: Transport, W: Write> Session<T, W> {
    pub fn new(
        transport: T,
        settings: &Settings,
        requests: Receiver<Request>,
        output: W,
    ) -> Result<Session<T, W>> {
        settings.validate()?;
        Ok(Session {
            transport,
            timing: settings.timing,
            network: settings.network,
            network_key: settings.network_key,
            new_beats_only: settings.new_beats_only,
            state: State::Reset,
            decoder: FrameDecoder::new(),
            slots: BTreeMap::new(),
            startup_channels: settings.channels()?,
            reopen: BTreeMap::new(),
            outbound: VecDeque::new(),
            pending: None,
            requests,
            emitter: Emitter::new(output),
            capabilities: None,
        })
    }

    /// Capabilities reported by the radio during startup.
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.capabilities
    }

    pub fn channel_state(&self, number: u8) -> Option<ChannelState> {
        self.slots.get(&number).map(|slot| slot.channel.state())
    }

    /// Gives back the transport and output stream once the session is over.
    pub fn into_inner(self) -> (T, W) {
        (self.transport, self.emitter.into_inner())
    }

    /// Runs until a `Quit` request or a fatal error. The output stream always
    /// ends with a session end record, when it can still be written.
    pub fn run(&mut self) -> Result<()> {
        match self.drive() {
            Ok(()) => {
                self.emitter.terminate(SessionEnd::Stopped)?;
                Ok(())
            }
            Err(e) => {
                error!("Session failed: {}", e);
                self.fail_all();
                if let Err(write_err) = self.emitter.terminate(SessionEnd::Fault {
                    cause: e.to_string(),
                }) {
                    debug!("Could not write session end: {}", write_err);
                }
                if let Err(close_err) = self.transport.close() {
                    debug!("Could not release transport: {}", close_err);
                }
                Err(e)
            }
        }
    }

    fn drive(&mut self) -> Result<()> {
        info!("Resetting radio");
        self.state = State::Reset;
        self.queue(Owner::Radio, message::reset());

        loop {
            self.poll_requests()?;
            if self.state == State::ShuttingDown && self.is_drained() {
                break;
            }
            if let Some(bytes) = self.transport.read(self.timing.read_timeout())? {
                trace!("Read {} bytes", bytes.len());
                self.decoder.extend(&bytes);
                self.drain_frames()?;
            }
            let now = Instant::now();
            self.check_pending(now)?;
            self.check_signals(now)?;
            self.resume_reopens()?;
            self.pump(now)?;
        }

        self.transport.close()?;
        info!("Session stopped");
        Ok(())
    }

    fn poll_requests(&mut self) -> Result<()> {
        loop {
            match self.requests.try_recv() {
                Ok(Request::Quit) if self.state == State::ShuttingDown => {}
                Ok(Request::Quit) => {
                    info!("Stop requested");
                    self.begin_shutdown()?;
                }
                Ok(Request::OpenChannel(number, config)) => self.open_channel(number, config)?,
                Ok(Request::CloseChannel(number)) => self.close_channel(number)?,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    if self.state != State::ShuttingDown {
                        debug!("Request channel disconnected, stopping");
                        self.begin_shutdown()?;
                    }
                    return Ok(());
                }
            }
        }
    }

    fn drain_frames(&mut self) -> Result<()> {
        loop {
            match self.decoder.decode() {
                Ok(Some(mesg)) => {
                    trace!("Received {:?}", mesg);
                    self.route(classify(&mesg))?;
                }
                Ok(None) => return Ok(()),
                Err(e) => debug!("Dropping frame: {}", e),
            }
        }
    }

    fn route(&mut self, response: Response) -> Result<()> {
        match response {
            Response::Startup(reason) => self.on_startup(reason),
            Response::Capabilities(caps) => self.on_capabilities(caps),
            Response::ChannelResponse {
                channel,
                command_id,
                code,
            } => self.on_channel_response(channel, command_id, code),
            Response::ChannelEvent { channel, code } => self.on_channel_event(channel, code),
            Response::BroadcastData(data) => self.on_broadcast(data),
            Response::ChannelId(id) => {
                self.on_channel_id(id);
                Ok(())
            }
            Response::Unknown { id, data } => {
                debug!("Dropping message 0x{:02X}: {:02X?}", id, data);
                Ok(())
            }
        }
    }

    /// Takes the pending request if `expect` is what it waits for.
    fn settle(&mut self, expect: Expect) -> Option<PendingRequest> {
        match &self.pending {
            Some(pending) if pending.expect == expect => self.pending.take(),
            _ => None,
        }
    }

    fn on_startup(&mut self, reason: StartupReason) -> Result<()> {
        if self.settle(Expect::Startup).is_some() {
            debug!("Radio reset ({:?}), requesting capabilities", reason);
            self.state = State::Capabilities;
            self.queue(Owner::Radio, message::get_capabilities());
            return Ok(());
        }
        if self.state == State::Running {
            // Every channel is gone on the radio side.
            warn!("Radio reset unexpectedly ({:?})", reason);
            self.fail_channels()?;
        } else {
            debug!("Ignoring startup message ({:?})", reason);
        }
        Ok(())
    }

    fn on_capabilities(&mut self, caps: Capabilities) -> Result<()> {
        if self.settle(Expect::Capabilities).is_none() {
            debug!("Ignoring unrequested capabilities");
            return Ok(());
        }
        info!(
            "Radio supports {} channels on {} networks",
            caps.max_channels, caps.max_networks
        );
        self.capabilities = Some(caps);
        if let Some((number, _)) = self
            .startup_channels
            .iter()
            .find(|(number, _)| *number >= caps.max_channels)
        {
            return Err(AntError::Configuration(format!(
                "channel {} configured but the radio only has {} channels",
                number, caps.max_channels
            )));
        }
        if self.network >= caps.max_networks {
            return Err(AntError::Configuration(format!(
                "network {} configured but the radio only has {} networks",
                self.network, caps.max_networks
            )));
        }
        self.state = State::NetworkKey;
        self.queue(
            Owner::Radio,
            message::set_network_key(self.network, &self.network_key),
        );
        Ok(())
    }

    fn on_channel_response(
        &mut self,
        channel: u8,
        command_id: u8,
        code: ChannelResponseCode,
    ) -> Result<()> {
        let pending = match self.settle(Expect::Response {
            channel,
            command_id,
        }) {
            Some(pending) => pending,
            None => {
                debug!(
                    "Ignoring response {:?} to 0x{:02X} on channel {}",
                    code, command_id, channel
                );
                return Ok(());
            }
        };

        match pending.owner {
            Owner::Radio => {
                if code != ChannelResponseCode::ResponseNoError {
                    return Err(AntError::Configuration(format!(
                        "radio rejected the network key for network {}: {:?}",
                        self.network, code
                    )));
                }
                info!("Network key set, opening channels");
                self.state = State::Running;
                let channels = std::mem::take(&mut self.startup_channels);
                for (number, config) in channels {
                    self.open_channel(number, config)?;
                }
                Ok(())
            }
            Owner::Channel(number) => {
                let result = match self.slots.get_mut(&number) {
                    Some(slot) => slot.channel.on_response(command_id, code),
                    None => return Ok(()),
                };
                match result {
                    Ok(outcome) => self.apply(number, outcome),
                    Err(fault) => self.fault(number, fault),
                }
            }
        }
    }

    fn on_channel_event(&mut self, channel: u8, code: ChannelResponseCode) -> Result<()> {
        let outcome = match self.slots.get_mut(&channel) {
            Some(slot) => slot.channel.on_event(code),
            None => {
                debug!("Event {:?} for unknown channel {}", code, channel);
                return Ok(());
            }
        };
        self.apply(channel, outcome)
    }

    fn on_broadcast(&mut self, data: BroadcastData) -> Result<()> {
        let now = Instant::now();
        let slot = match self.slots.get_mut(&data.channel) {
            Some(slot) => slot,
            None => {
                debug!("Broadcast on unknown channel {}", data.channel);
                return Ok(());
            }
        };
        let outcome = match slot.channel.on_broadcast(now) {
            Ok(outcome) => outcome,
            Err(fault) => {
                debug!("{}", fault);
                return Ok(());
            }
        };
        let identity = slot.identity();
        let decoded = slot.device.decode(&data.data);
        self.apply(data.channel, outcome)?;

        match decoded {
            Ok(decoded) => {
                let new_beats_only = self.new_beats_only
                    && matches!(decoded.measurement, Measurement::HeartRate(_));
                if new_beats_only && decoded.repeated {
                    trace!("Channel {} repeated beat, skipping", data.channel);
                    return Ok(());
                }
                let reading = self
                    .emitter
                    .reading(data.channel, identity, data.page(), decoded);
                self.emitter.emit(&reading)?;
            }
            Err(e) => debug!("Channel {}: {}", data.channel, e),
        }
        Ok(())
    }

    fn on_channel_id(&mut self, id: ChannelId) {
        if self.settle(Expect::ChannelId(id.channel)).is_none() {
            debug!("Ignoring unrequested channel id {:?}", id);
        }
        if let Some(slot) = self.slots.get_mut(&id.channel) {
            info!(
                "Channel {} paired with device {} (type 0x{:02X})",
                id.channel, id.device_number, id.device_type
            );
            slot.channel.set_paired(id);
        }
    }

    fn open_channel(&mut self, number: u8, config: channel::Config) -> Result<()> {
        match self.state {
            State::Running => {}
            State::ShuttingDown => {
                warn!("Not opening channel {} while shutting down", number);
                return Ok(());
            }
            _ => {
                self.startup_channels.push((number, config));
                return Ok(());
            }
        }
        let busy = self.slots.get(&number).and_then(|slot| {
            if slot.channel.is_released() {
                return None;
            }
            let idle = matches!(
                slot.channel.state(),
                ChannelState::Unassigned | ChannelState::Closed | ChannelState::Error
            );
            Some(idle || slot.channel.is_closing())
        });
        match busy {
            Some(false) => {
                warn!("Channel {} is already in use", number);
                return Ok(());
            }
            Some(true) => {
                // The number still holds a slot on the radio. Release it first.
                debug!("Channel {} reopens once the radio releases it", number);
                self.forget(number);
                let in_flight = self.in_flight(number);
                let outcome = match self.slots.get_mut(&number) {
                    Some(slot) => slot.channel.close(in_flight),
                    None => Outcome::default(),
                };
                self.reopen.insert(number, config);
                return self.apply(number, outcome);
            }
            None => {}
        }
        if let Some(caps) = self.capabilities {
            if number >= caps.max_channels {
                warn!(
                    "Channel {} out of range, the radio has {} channels",
                    number, caps.max_channels
                );
                return Ok(());
            }
        }
        let profile = match crate::device::Profile::from_device_type(config.get_device_type()) {
            Some(profile) => profile,
            None => {
                warn!(
                    "Channel {}: unsupported device type 0x{:02X}",
                    number,
                    config.get_device_type()
                );
                return Ok(());
            }
        };

        debug!("Opening channel {} for {:?}", number, profile);
        let mut channel = Channel::new(number, self.network, config);
        let command = channel.assign();
        self.slots.insert(
            number,
            Slot {
                channel,
                device: profile.device(),
            },
        );
        match command {
            Ok(command) => {
                self.queue(Owner::Channel(number), command);
                Ok(())
            }
            Err(fault) => self.fault(number, fault),
        }
    }

    fn close_channel(&mut self, number: u8) -> Result<()> {
        self.reopen.remove(&number);
        self.forget(number);
        let in_flight = self.in_flight(number);
        let outcome = match self.slots.get_mut(&number) {
            Some(slot) => {
                info!("Closing channel {}", number);
                slot.channel.close(in_flight)
            }
            None => {
                debug!("Close requested for unknown channel {}", number);
                return Ok(());
            }
        };
        self.apply(number, outcome)
    }

    /// Stops taking requests and closes every channel. A command already on
    /// its way to the radio still gets its answer or times out first.
    fn begin_shutdown(&mut self) -> Result<()> {
        self.state = State::ShuttingDown;
        self.startup_channels.clear();
        self.reopen.clear();
        self.outbound.clear();
        let numbers: Vec<u8> = self.slots.keys().copied().collect();
        for number in numbers {
            self.close_channel(number)?;
        }
        Ok(())
    }

    fn is_drained(&self) -> bool {
        self.pending.is_none()
            && self.outbound.is_empty()
            && self.slots.values().all(|slot| slot.channel.is_terminal())
    }

    /// Drops the commands a channel queued but never sent.
    fn forget(&mut self, number: u8) {
        self.outbound
            .retain(|(owner, _)| *owner != Owner::Channel(number));
    }

    /// The channel's own configuration or teardown command is on the radio.
    fn in_flight(&self, number: u8) -> bool {
        match &self.pending {
            Some(pending) => {
                pending.owner == Owner::Channel(number)
                    && matches!(pending.expect, Expect::Response { .. })
            }
            None => false,
        }
    }

    fn resume_reopens(&mut self) -> Result<()> {
        if self.state != State::Running {
            return Ok(());
        }
        let ready: Vec<u8> = self
            .reopen
            .keys()
            .copied()
            .filter(|number| {
                self.slots
                    .get(number)
                    .map_or(true, |slot| slot.channel.is_released())
            })
            .collect();
        for number in ready {
            if let Some(config) = self.reopen.remove(&number) {
                self.open_channel(number, config)?;
            }
        }
        Ok(())
    }

    fn apply(&mut self, number: u8, outcome: Outcome) -> Result<()> {
        if let Some(command) = outcome.command {
            self.queue(Owner::Channel(number), command);
        }
        if let Some(status) = outcome.status {
            self.report(number, status)?;
        }
        Ok(())
    }

    fn report(&mut self, number: u8, status: ChannelStatus) -> Result<()> {
        let identity = match self.slots.get(&number) {
            Some(slot) => slot.identity(),
            None => return Ok(()),
        };
        self.emitter.status(number, identity, status)?;
        Ok(())
    }

    fn fault(&mut self, number: u8, fault: ChannelFault) -> Result<()> {
        if let ChannelFault::ProtocolViolation { .. } = fault {
            debug!("{}", fault);
            return Ok(());
        }
        warn!("{}", fault);
        self.forget(number);
        let outcome = match self.slots.get_mut(&number) {
            Some(slot) => slot.channel.fail(),
            None => return Ok(()),
        };
        self.apply(number, outcome)
    }

    /// The radio lost every channel. Moves each live one to `Error`, reporting
    /// each one.
    fn fail_channels(&mut self) -> Result<()> {
        if matches!(&self.pending, Some(p) if p.owner != Owner::Radio) {
            self.pending = None;
        }
        self.reopen.clear();
        let numbers: Vec<u8> = self.slots.keys().copied().collect();
        for number in numbers {
            self.forget(number);
            let outcome = match self.slots.get_mut(&number) {
                Some(slot) => {
                    slot.channel.radio_lost();
                    if slot.channel.state() == ChannelState::Closed {
                        continue;
                    }
                    slot.channel.fail()
                }
                None => continue,
            };
            self.apply(number, outcome)?;
        }
        Ok(())
    }

    /// Best effort version of `fail_channels` for the fatal error path.
    fn fail_all(&mut self) {
        if let Err(e) = self.fail_channels() {
            debug!("Could not report channel errors: {}", e);
        }
    }

    fn check_pending(&mut self, now: Instant) -> Result<()> {
        let timeout = self.timing.command_timeout();
        let mut pending = match self.pending.take() {
            Some(pending) if now.saturating_duration_since(pending.sent_at) >= timeout => pending,
            other => {
                self.pending = other;
                return Ok(());
            }
        };

        if pending.retries < self.timing.command_retries {
            pending.retries += 1;
            debug!(
                "No answer to {:?}, retry {} of {}",
                pending.message, pending.retries, self.timing.command_retries
            );
            self.transport.write(&pending.message.encode())?;
            pending.sent_at = now;
            self.pending = Some(pending);
            return Ok(());
        }

        match (pending.owner, pending.expect) {
            (Owner::Radio, _) => Err(AntError::RadioUnresponsive(pending.message.id)),
            // The channel keeps running without knowing who it paired with.
            (Owner::Channel(number), Expect::ChannelId(_)) => {
                warn!("Channel {} did not report its channel id", number);
                Ok(())
            }
            (Owner::Channel(number), _) => self.fault(
                number,
                ChannelFault::CommandTimeout {
                    channel: number,
                    command_id: pending.message.id,
                    attempts: pending.retries + 1,
                },
            ),
        }
    }

    fn check_signals(&mut self, now: Instant) -> Result<()> {
        let periods = self.timing.signal_loss_periods;
        let lost: Vec<(u8, Outcome)> = self
            .slots
            .iter_mut()
            .map(|(number, slot)| (*number, slot.channel.check_signal(now, periods)))
            .filter(|(_, outcome)| *outcome != Outcome::default())
            .collect();
        for (number, outcome) in lost {
            self.apply(number, outcome)?;
        }
        Ok(())
    }

    fn queue(&mut self, owner: Owner, command: Message) {
        trace!("Queueing {:?}", command);
        self.outbound.push_back((owner, command));
    }

    /// Sends the next queued command when nothing is in flight.
    fn pump(&mut self, now: Instant) -> Result<()> {
        if self.pending.is_some() {
            return Ok(());
        }
        if let Some((owner, message)) = self.outbound.pop_front() {
            trace!("Sending {:?}", message);
            self.transport.write(&message.encode())?;
            self.pending = Some(PendingRequest {
                expect: Expect::of(&message),
                owner,
                message,
                sent_at: now,
                retries: 0,
            });
        }
        Ok(())
    }
}
