//! waph — the pulse-height transformer worker
//!
//! Subscribes to raw waveform frames, compensates the preamplifier decay,
//! shapes each pulse with a trapezoidal filter and publishes 16-byte
//! events carrying the trapezoid and peak heights. Shares the state
//! machine pattern of the pulse-shape transformer; there is no selection
//! plug-in, and forwarding without gates re-emits the incoming message
//! verbatim.

pub mod analysis;

use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::channels::{ChannelMap, PhaChannelParameters};
use crate::common::cli::WaphArgs;
use crate::common::defaults;
use crate::common::{PipelineError, StatusReporter};
use crate::fsm::{self, State};
use crate::protocol;
use crate::transport;

use analysis::{ProcessingOptions, Scratch, Statistics};

pub const MODULE: &str = "waph";

/// Immutable run settings, bound from the command line
#[derive(Debug, Clone)]
pub struct Settings {
    pub subscribe_address: String,
    pub publish_address: String,
    pub status_address: String,
    pub commands_address: String,
    pub config_file: String,
    pub base_period: Duration,
    pub options: ProcessingOptions,
}

impl From<&WaphArgs> for Settings {
    fn from(args: &WaphArgs) -> Self {
        Self {
            subscribe_address: args.subscribe_address.clone(),
            publish_address: args.publish_address.clone(),
            status_address: args.status_address.clone(),
            commands_address: args.commands_address.clone(),
            config_file: args.config_file.clone(),
            base_period: Duration::from_millis(args.base_period),
            options: ProcessingOptions {
                forward_waveforms: args.forward_waveforms,
                enable_gates: args.enable_gates,
            },
        }
    }
}

/// The worker context threaded through every state action
pub struct Status {
    pub settings: Settings,

    context: Option<zmq::Context>,
    status_socket: Option<zmq::Socket>,
    data_input_socket: Option<zmq::Socket>,
    data_output_socket: Option<zmq::Socket>,
    commands_socket: Option<zmq::Socket>,

    config: Option<Value>,
    channels: ChannelMap<PhaChannelParameters>,
    configured: bool,

    reporter: StatusReporter,
    scratch: Scratch,
    statistics: Statistics,

    last_publication: Option<Instant>,
    pending_error: Option<PipelineError>,
    errored: bool,
}

impl Status {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            context: None,
            status_socket: None,
            data_input_socket: None,
            data_output_socket: None,
            commands_socket: None,
            config: None,
            channels: ChannelMap::default(),
            configured: false,
            reporter: StatusReporter::new(MODULE),
            scratch: Scratch::default(),
            statistics: Statistics::default(),
            last_publication: None,
            pending_error: None,
            errored: false,
        }
    }

    /// Nonzero when the worker went down through an error state
    pub fn exit_code(&self) -> i32 {
        i32::from(self.errored)
    }

    fn fail(&mut self, error: PipelineError, next: WaphState) -> WaphState {
        self.pending_error = Some(error);
        next
    }

    fn report_pending(&mut self) {
        if let Some(error) = self.pending_error.take() {
            error!(module = MODULE, error = %error, "worker error");
            self.reporter
                .publish_error(self.status_socket.as_ref(), &error);
        }
    }
}

pub type WaphState = State<Status>;

/// Drive the worker to completion and return its exit code.
pub fn run(status: &mut Status, terminate: &AtomicBool) -> i32 {
    let base_period = status.settings.base_period;
    fsm::run(
        states::START,
        states::CLEAR_MEMORY,
        states::STOP,
        status,
        terminate,
        base_period,
    );
    status.exit_code()
}

// ---------------------------------------------------------------------------
// State actions
// ---------------------------------------------------------------------------

mod actions {
    use super::*;

    pub(super) fn start(status: &mut Status) -> WaphState {
        info!(
            module = MODULE,
            subscribe = %status.settings.subscribe_address,
            publish = %status.settings.publish_address,
            "starting"
        );
        states::CREATE_CONTEXT
    }

    pub(super) fn create_context(status: &mut Status) -> WaphState {
        status.context = Some(zmq::Context::new());
        states::CREATE_SOCKETS
    }

    pub(super) fn create_sockets(status: &mut Status) -> WaphState {
        let Some(context) = status.context.clone() else {
            return status.fail(
                PipelineError::Transport(zmq::Error::EFAULT),
                states::COMMUNICATION_ERROR,
            );
        };

        let sockets = (|| -> Result<_, zmq::Error> {
            let status_socket = context.socket(zmq::PUB)?;
            let data_input = context.socket(zmq::SUB)?;
            let data_output = context.socket(zmq::PUB)?;
            let commands = context.socket(zmq::PULL)?;
            Ok((status_socket, data_input, data_output, commands))
        })();

        match sockets {
            Ok((status_socket, data_input, data_output, commands)) => {
                status.status_socket = Some(status_socket);
                status.data_input_socket = Some(data_input);
                status.data_output_socket = Some(data_output);
                status.commands_socket = Some(commands);
                states::BIND_SOCKETS
            }
            Err(error) => status.fail(error.into(), states::COMMUNICATION_ERROR),
        }
    }

    pub(super) fn bind_sockets(status: &mut Status) -> WaphState {
        let result = (|| -> Result<(), zmq::Error> {
            if let Some(socket) = &status.status_socket {
                socket.bind(&status.settings.status_address)?;
            }
            if let Some(socket) = &status.data_output_socket {
                socket.bind(&status.settings.publish_address)?;
            }
            if let Some(socket) = &status.data_input_socket {
                socket.connect(&status.settings.subscribe_address)?;
                socket.set_subscribe(protocol::WAVEFORMS_TOPIC_PREFIX.as_bytes())?;
            }
            if let Some(socket) = &status.commands_socket {
                socket.bind(&status.settings.commands_address)?;
            }
            Ok(())
        })();

        if let Err(error) = result {
            return status.fail(error.into(), states::COMMUNICATION_ERROR);
        }

        thread::sleep(Duration::from_millis(defaults::SLOW_JOINER_WAIT_MS));
        states::READ_CONFIG
    }

    pub(super) fn read_config(status: &mut Status) -> WaphState {
        let text = match std::fs::read_to_string(&status.settings.config_file) {
            Ok(text) => text,
            Err(error) => return status.fail(error.into(), states::PARSE_ERROR),
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(config) => {
                info!(module = MODULE, file = %status.settings.config_file, "configuration read");
                status.config = Some(config);
                states::APPLY_CONFIG
            }
            Err(error) => status.fail(error.into(), states::PARSE_ERROR),
        }
    }

    pub(super) fn apply_config(status: &mut Status) -> WaphState {
        let Some(config) = &status.config else {
            return status.fail(
                PipelineError::configure("no configuration loaded"),
                states::CONFIGURE_ERROR,
            );
        };

        match ChannelMap::from_config(config) {
            Ok(channels) => {
                info!(module = MODULE, channels = channels.len(), "configuration applied");
                status.channels = channels;
                status.configured = true;
                states::PUBLISH_STATUS
            }
            Err(error) => status.fail(error, states::CONFIGURE_ERROR),
        }
    }

    pub(super) fn publish_status(status: &mut Status) -> WaphState {
        let due = status
            .last_publication
            .map(|instant| instant.elapsed() >= Duration::from_secs(defaults::PUBLISH_PERIOD_SECS))
            .unwrap_or(true);
        if !due {
            return states::RECEIVE_COMMANDS;
        }

        let extra = json!({
            "config": status.config.clone().unwrap_or(Value::Null),
            "statistics": {
                "messages": status.statistics.messages_counter,
                "events": status.statistics.events_counter,
                "emitted": status.statistics.emitted_counter,
                "inactive": status.statistics.inactive_counter,
                "skipped": status.statistics.skipped_counter,
            },
        });

        if let Err(error) = status
            .reporter
            .publish_status(status.status_socket.as_ref(), extra)
        {
            return status.fail(error, states::COMMUNICATION_ERROR);
        }

        status.last_publication = Some(Instant::now());
        states::RECEIVE_COMMANDS
    }

    pub(super) fn receive_commands(status: &mut Status) -> WaphState {
        let Some(socket) = &status.commands_socket else {
            return states::READ_SOCKET;
        };

        match transport::receive_raw(socket) {
            Ok(Some(payload)) => handle_command(status, &payload),
            Ok(None) => states::READ_SOCKET,
            Err(error) => status.fail(error, states::COMMUNICATION_ERROR),
        }
    }

    pub(super) fn handle_command(status: &mut Status, payload: &[u8]) -> WaphState {
        let command: Value = match serde_json::from_slice(payload) {
            Ok(command) => command,
            Err(error) => {
                warn!(module = MODULE, %error, "discarding malformed command");
                let error = PipelineError::Parse(error);
                status
                    .reporter
                    .publish_error(status.status_socket.as_ref(), &error);
                return states::READ_SOCKET;
            }
        };

        match command.get("command").and_then(Value::as_str) {
            Some("reconfigure") => match command.pointer("/arguments/config") {
                Some(new_config) => {
                    info!(module = MODULE, "reconfiguration requested");
                    status.config = Some(new_config.clone());
                    states::APPLY_CONFIG
                }
                None => {
                    warn!(module = MODULE, "reconfigure without a config object");
                    let error = PipelineError::configure("reconfigure without a config object");
                    status
                        .reporter
                        .publish_error(status.status_socket.as_ref(), &error);
                    states::READ_SOCKET
                }
            },
            Some("quit") => {
                info!(module = MODULE, "quit requested");
                states::CLEAR_MEMORY
            }
            other => {
                warn!(module = MODULE, command = ?other, "unknown command");
                states::READ_SOCKET
            }
        }
    }

    pub(super) fn read_socket(status: &mut Status) -> WaphState {
        let Some(socket) = &status.data_input_socket else {
            return states::PUBLISH_STATUS;
        };

        let message = match transport::receive_message(socket) {
            Ok(message) => message,
            Err(error) => return status.fail(error, states::COMMUNICATION_ERROR),
        };

        let Some((topic, payload)) = message else {
            return states::PUBLISH_STATUS;
        };

        if !topic.starts_with(protocol::WAVEFORMS_TOPIC_PREFIX) {
            debug!(module = MODULE, topic, "ignoring unexpected topic");
            return states::PUBLISH_STATUS;
        }
        debug!(module = MODULE, topic, size = payload.len(), "message received");

        let options = &status.settings.options;
        let forward_verbatim = options.forward_waveforms && !options.enable_gates;

        let (events, waveforms) = analysis::process_message(
            &payload,
            &status.channels,
            options,
            &mut status.scratch,
            &mut status.statistics,
        );

        let result = (|| -> Result<(), PipelineError> {
            let Some(output) = &status.data_output_socket else {
                return Ok(());
            };
            if forward_verbatim {
                // Without gates the whole input message passes through.
                transport::send_message(output, &topic, &payload)?;
            }
            if !events.is_empty() {
                let topic = protocol::events_data_topic(events.len());
                transport::send_message(output, &topic, &events)?;
            }
            if !waveforms.is_empty() {
                let topic = protocol::waveforms_data_topic(waveforms.len());
                transport::send_message(output, &topic, &waveforms)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => states::PUBLISH_STATUS,
            Err(error) => status.fail(error, states::COMMUNICATION_ERROR),
        }
    }

    pub(super) fn clear_memory(status: &mut Status) -> WaphState {
        status.channels = ChannelMap::default();
        status.config = None;
        states::CLOSE_SOCKETS
    }

    pub(super) fn close_sockets(status: &mut Status) -> WaphState {
        status.status_socket = None;
        status.data_input_socket = None;
        status.data_output_socket = None;
        status.commands_socket = None;
        states::DESTROY_CONTEXT
    }

    pub(super) fn destroy_context(status: &mut Status) -> WaphState {
        status.context = None;
        info!(module = MODULE, "stopped");
        states::STOP
    }

    pub(super) fn stop(_status: &mut Status) -> WaphState {
        states::STOP
    }

    pub(super) fn communication_error(status: &mut Status) -> WaphState {
        status.errored = true;
        status.report_pending();
        states::CLEAR_MEMORY
    }

    pub(super) fn parse_error(status: &mut Status) -> WaphState {
        status.errored = true;
        status.report_pending();
        states::CLEAR_MEMORY
    }

    pub(super) fn configure_error(status: &mut Status) -> WaphState {
        status.report_pending();
        if status.configured {
            warn!(module = MODULE, "keeping the previous configuration");
            states::PUBLISH_STATUS
        } else {
            status.errored = true;
            states::CLEAR_MEMORY
        }
    }
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

pub mod states {
    use super::*;

    // Initialization states are 1xx
    pub const START: WaphState = State {
        id: 100,
        description: "Start",
        action: actions::start,
    };
    pub const CREATE_CONTEXT: WaphState = State {
        id: 101,
        description: "Create ZeroMQ context",
        action: actions::create_context,
    };
    pub const CREATE_SOCKETS: WaphState = State {
        id: 102,
        description: "Create sockets",
        action: actions::create_sockets,
    };
    pub const BIND_SOCKETS: WaphState = State {
        id: 103,
        description: "Bind sockets",
        action: actions::bind_sockets,
    };
    pub const READ_CONFIG: WaphState = State {
        id: 104,
        description: "Read configuration",
        action: actions::read_config,
    };

    // Normal states are 2xx
    pub const APPLY_CONFIG: WaphState = State {
        id: 201,
        description: "Apply configuration",
        action: actions::apply_config,
    };
    pub const PUBLISH_STATUS: WaphState = State {
        id: 202,
        description: "Publish status",
        action: actions::publish_status,
    };
    pub const RECEIVE_COMMANDS: WaphState = State {
        id: 203,
        description: "Receive commands",
        action: actions::receive_commands,
    };
    pub const READ_SOCKET: WaphState = State {
        id: 204,
        description: "Read socket",
        action: actions::read_socket,
    };

    // Closing states are 8xx
    pub const CLEAR_MEMORY: WaphState = State {
        id: 801,
        description: "Clear memory",
        action: actions::clear_memory,
    };
    pub const CLOSE_SOCKETS: WaphState = State {
        id: 802,
        description: "Close sockets",
        action: actions::close_sockets,
    };
    pub const DESTROY_CONTEXT: WaphState = State {
        id: 803,
        description: "Destroy ZeroMQ context",
        action: actions::destroy_context,
    };
    pub const STOP: WaphState = State {
        id: 899,
        description: "Stop",
        action: actions::stop,
    };

    // Error states are 9xx
    pub const COMMUNICATION_ERROR: WaphState = State {
        id: 901,
        description: "Communication error",
        action: actions::communication_error,
    };
    pub const PARSE_ERROR: WaphState = State {
        id: 902,
        description: "Config parse error",
        action: actions::parse_error,
    };
    pub const CONFIGURE_ERROR: WaphState = State {
        id: 903,
        description: "Configure error",
        action: actions::configure_error,
    };
}
