//! waps — the pulse-shape transformer worker
//!
//! Subscribes to raw waveform frames, runs the per-channel DSP chain and
//! publishes 16-byte feature events, optionally re-emitting the waveforms
//! with diagnostic gate lanes. The worker is a deterministic state
//! machine: initialization states create and bind the sockets and load
//! the configuration and the selection plug-in; the steady-state cycle
//! publishes status, drains commands and reads the data socket; fatal
//! errors fall through the shutdown chain so the process always exits
//! cleanly.

pub mod analysis;

use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::channels::{ChannelMap, PsdChannelParameters};
use crate::common::cli::WapsArgs;
use crate::common::defaults;
use crate::common::{PipelineError, StatusReporter};
use crate::fsm::{self, State};
use crate::plugin::SelectionPlugin;
use crate::protocol;
use crate::transport;

use analysis::{ProcessingOptions, Scratch, Statistics};

pub const MODULE: &str = "waps";

/// Immutable run settings, bound from the command line
#[derive(Debug, Clone)]
pub struct Settings {
    pub subscribe_address: String,
    pub publish_address: String,
    pub status_address: String,
    pub commands_address: String,
    pub config_file: String,
    pub selection_library: Option<String>,
    pub base_period: Duration,
    pub options: ProcessingOptions,
}

impl From<&WapsArgs> for Settings {
    fn from(args: &WapsArgs) -> Self {
        Self {
            subscribe_address: args.subscribe_address.clone(),
            publish_address: args.publish_address.clone(),
            status_address: args.status_address.clone(),
            commands_address: args.commands_address.clone(),
            config_file: args.config_file.clone(),
            selection_library: args.selection_library.clone(),
            base_period: Duration::from_millis(args.base_period),
            options: ProcessingOptions {
                forward_waveforms: args.forward_waveforms,
                enable_gates: args.enable_gates,
                disable_shift: args.disable_shift,
                variance_multiplier: args.variance_multiplier,
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
    channels: ChannelMap<PsdChannelParameters>,
    /// Whether an APPLY_CONFIG has ever succeeded
    configured: bool,

    plugin: SelectionPlugin,
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
            plugin: SelectionPlugin::identity(),
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

    fn fail(&mut self, error: PipelineError, next: WapsState) -> WapsState {
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

pub type WapsState = State<Status>;

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

    pub(super) fn start(status: &mut Status) -> WapsState {
        info!(
            module = MODULE,
            subscribe = %status.settings.subscribe_address,
            publish = %status.settings.publish_address,
            "starting"
        );
        states::CREATE_CONTEXT
    }

    pub(super) fn create_context(status: &mut Status) -> WapsState {
        status.context = Some(zmq::Context::new());
        states::CREATE_SOCKETS
    }

    pub(super) fn create_sockets(status: &mut Status) -> WapsState {
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

    pub(super) fn bind_sockets(status: &mut Status) -> WapsState {
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

        // Give the subscriptions time to propagate before data flows.
        thread::sleep(Duration::from_millis(defaults::SLOW_JOINER_WAIT_MS));
        states::READ_CONFIG
    }

    pub(super) fn read_config(status: &mut Status) -> WapsState {
        let text = match std::fs::read_to_string(&status.settings.config_file) {
            Ok(text) => text,
            Err(error) => return status.fail(error.into(), states::PARSE_ERROR),
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(config) => {
                info!(module = MODULE, file = %status.settings.config_file, "configuration read");
                status.config = Some(config);
                states::LOAD_PLUGIN
            }
            Err(error) => status.fail(error.into(), states::PARSE_ERROR),
        }
    }

    pub(super) fn load_plugin(status: &mut Status) -> WapsState {
        let Some(library) = status.settings.selection_library.clone() else {
            debug!(module = MODULE, "no selection library, using the identity");
            return states::APPLY_CONFIG;
        };

        match SelectionPlugin::load(&library) {
            Ok(plugin) => {
                status.plugin = plugin;
                states::APPLY_CONFIG
            }
            Err(error) => status.fail(error, states::PLUGIN_ERROR),
        }
    }

    pub(super) fn apply_config(status: &mut Status) -> WapsState {
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

    pub(super) fn publish_status(status: &mut Status) -> WapsState {
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
                "selected": status.statistics.selected_counter,
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

    pub(super) fn receive_commands(status: &mut Status) -> WapsState {
        let Some(socket) = &status.commands_socket else {
            return states::READ_SOCKET;
        };

        match transport::receive_raw(socket) {
            Ok(Some(payload)) => handle_command(status, &payload),
            Ok(None) => states::READ_SOCKET,
            Err(error) => status.fail(error, states::COMMUNICATION_ERROR),
        }
    }

    /// Dispatch one JSON command. Malformed commands are reported and the
    /// worker stays live.
    pub(super) fn handle_command(status: &mut Status, payload: &[u8]) -> WapsState {
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

    pub(super) fn read_socket(status: &mut Status) -> WapsState {
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

        let (events, waveforms) = analysis::process_message(
            &payload,
            &status.channels,
            &status.settings.options,
            &mut status.plugin,
            &mut status.scratch,
            &mut status.statistics,
        );

        let result = (|| -> Result<(), PipelineError> {
            let Some(output) = &status.data_output_socket else {
                return Ok(());
            };
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

    pub(super) fn clear_memory(status: &mut Status) -> WapsState {
        status.channels = ChannelMap::default();
        status.config = None;
        status.plugin.close();
        states::CLOSE_SOCKETS
    }

    pub(super) fn close_sockets(status: &mut Status) -> WapsState {
        status.status_socket = None;
        status.data_input_socket = None;
        status.data_output_socket = None;
        status.commands_socket = None;
        states::DESTROY_CONTEXT
    }

    pub(super) fn destroy_context(status: &mut Status) -> WapsState {
        status.context = None;
        info!(module = MODULE, "stopped");
        states::STOP
    }

    pub(super) fn stop(_status: &mut Status) -> WapsState {
        states::STOP
    }

    pub(super) fn communication_error(status: &mut Status) -> WapsState {
        status.errored = true;
        status.report_pending();
        states::CLEAR_MEMORY
    }

    pub(super) fn parse_error(status: &mut Status) -> WapsState {
        status.errored = true;
        status.report_pending();
        states::CLEAR_MEMORY
    }

    pub(super) fn configure_error(status: &mut Status) -> WapsState {
        status.report_pending();
        if status.configured {
            // A previous table is still active: stay live with it.
            warn!(module = MODULE, "keeping the previous configuration");
            states::PUBLISH_STATUS
        } else {
            status.errored = true;
            states::CLEAR_MEMORY
        }
    }

    pub(super) fn plugin_error(status: &mut Status) -> WapsState {
        status.errored = true;
        status.report_pending();
        states::CLEAR_MEMORY
    }
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

pub mod states {
    use super::*;

    // Initialization states are 1xx
    pub const START: WapsState = State {
        id: 100,
        description: "Start",
        action: actions::start,
    };
    pub const CREATE_CONTEXT: WapsState = State {
        id: 101,
        description: "Create ZeroMQ context",
        action: actions::create_context,
    };
    pub const CREATE_SOCKETS: WapsState = State {
        id: 102,
        description: "Create sockets",
        action: actions::create_sockets,
    };
    pub const BIND_SOCKETS: WapsState = State {
        id: 103,
        description: "Bind sockets",
        action: actions::bind_sockets,
    };
    pub const READ_CONFIG: WapsState = State {
        id: 104,
        description: "Read configuration",
        action: actions::read_config,
    };
    pub const LOAD_PLUGIN: WapsState = State {
        id: 105,
        description: "Load selection plug-in",
        action: actions::load_plugin,
    };

    // Normal states are 2xx
    pub const APPLY_CONFIG: WapsState = State {
        id: 201,
        description: "Apply configuration",
        action: actions::apply_config,
    };
    pub const PUBLISH_STATUS: WapsState = State {
        id: 202,
        description: "Publish status",
        action: actions::publish_status,
    };
    pub const RECEIVE_COMMANDS: WapsState = State {
        id: 203,
        description: "Receive commands",
        action: actions::receive_commands,
    };
    pub const READ_SOCKET: WapsState = State {
        id: 204,
        description: "Read socket",
        action: actions::read_socket,
    };

    // Closing states are 8xx
    pub const CLEAR_MEMORY: WapsState = State {
        id: 801,
        description: "Clear memory",
        action: actions::clear_memory,
    };
    pub const CLOSE_SOCKETS: WapsState = State {
        id: 802,
        description: "Close sockets",
        action: actions::close_sockets,
    };
    pub const DESTROY_CONTEXT: WapsState = State {
        id: 803,
        description: "Destroy ZeroMQ context",
        action: actions::destroy_context,
    };
    pub const STOP: WapsState = State {
        id: 899,
        description: "Stop",
        action: actions::stop,
    };

    // Error states are 9xx
    pub const COMMUNICATION_ERROR: WapsState = State {
        id: 901,
        description: "Communication error",
        action: actions::communication_error,
    };
    pub const PARSE_ERROR: WapsState = State {
        id: 902,
        description: "Config parse error",
        action: actions::parse_error,
    };
    pub const CONFIGURE_ERROR: WapsState = State {
        id: 903,
        description: "Configure error",
        action: actions::configure_error,
    };
    pub const PLUGIN_ERROR: WapsState = State {
        id: 904,
        description: "Plug-in error",
        action: actions::plugin_error,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn test_settings() -> Settings {
        Settings {
            subscribe_address: defaults::ABCD_DATA_ADDRESS.to_string(),
            publish_address: defaults::WAPS_DATA_ADDRESS.to_string(),
            status_address: defaults::WAPS_STATUS_ADDRESS.to_string(),
            commands_address: defaults::WAPS_COMMANDS_ADDRESS.to_string(),
            config_file: "config.json".to_string(),
            selection_library: None,
            base_period: Duration::from_millis(defaults::BASE_PERIOD_MS),
            options: ProcessingOptions::default(),
        }
    }

    fn valid_config() -> Value {
        json!({
            "channels": [{
                "id": 0,
                "enabled": true,
                "charge_sensitivity": 0,
                "pretrigger": 60,
                "pregate": 10,
                "short_gate": 30,
                "long_gate": 80,
                "pulse_polarity": "positive",
            }]
        })
    }

    #[test]
    fn settings_from_args() {
        use clap::Parser;
        let args = crate::common::cli::WapsArgs::try_parse_from([
            "waps", "-T", "25", "-w", "-b", "config.json",
        ])
        .unwrap();
        let settings = Settings::from(&args);
        assert_eq!(settings.base_period, Duration::from_millis(25));
        assert!(settings.options.forward_waveforms);
        assert!(settings.options.disable_shift);
        assert!(!settings.options.enable_gates);
    }

    #[test]
    fn apply_config_builds_the_table() {
        let mut status = Status::new(test_settings());
        status.config = Some(valid_config());

        let next = actions::apply_config(&mut status);
        assert_eq!(next, states::PUBLISH_STATUS);
        assert!(status.configured);
        assert_eq!(status.channels.len(), 1);
    }

    #[test]
    fn reconfigure_failure_keeps_previous_table() {
        let mut status = Status::new(test_settings());
        status.config = Some(valid_config());
        assert_eq!(actions::apply_config(&mut status), states::PUBLISH_STATUS);

        // Reconfigure with a duplicated channel id.
        let bad = json!({
            "channels": [
                valid_config()["channels"][0].clone(),
                valid_config()["channels"][0].clone(),
            ]
        });
        status.config = Some(bad);
        let next = actions::apply_config(&mut status);
        assert_eq!(next, states::CONFIGURE_ERROR);

        // The previous table is still active and the worker stays live.
        assert_eq!(status.channels.len(), 1);
        let next = actions::configure_error(&mut status);
        assert_eq!(next, states::PUBLISH_STATUS);
        assert!(!status.errored);
        assert_eq!(status.exit_code(), 0);
    }

    #[test]
    fn startup_configure_failure_is_fatal() {
        let mut status = Status::new(test_settings());
        status.config = Some(json!({ "channels": [] }));

        let next = actions::apply_config(&mut status);
        assert_eq!(next, states::CONFIGURE_ERROR);
        let next = actions::configure_error(&mut status);
        assert_eq!(next, states::CLEAR_MEMORY);
        assert_eq!(status.exit_code(), 1);
    }

    #[test]
    fn reconfigure_command_swaps_config_and_reapplies() {
        let mut status = Status::new(test_settings());
        let command = json!({
            "command": "reconfigure",
            "arguments": { "config": valid_config() },
        });

        let next = actions::handle_command(&mut status, command.to_string().as_bytes());
        assert_eq!(next, states::APPLY_CONFIG);
        assert_eq!(status.config, Some(valid_config()));
    }

    #[test]
    fn quit_command_enters_shutdown_chain() {
        let mut status = Status::new(test_settings());
        let next = actions::handle_command(&mut status, br#"{"command": "quit"}"#);
        assert_eq!(next, states::CLEAR_MEMORY);
        assert_eq!(status.exit_code(), 0);
    }

    #[test]
    fn malformed_command_keeps_the_worker_live() {
        let mut status = Status::new(test_settings());
        let next = actions::handle_command(&mut status, b"{not json");
        assert_eq!(next, states::READ_SOCKET);
        assert!(!status.errored);
    }

    #[test]
    fn unknown_command_is_ignored() {
        let mut status = Status::new(test_settings());
        let next = actions::handle_command(&mut status, br#"{"command": "dance"}"#);
        assert_eq!(next, states::READ_SOCKET);
    }

    #[test]
    fn read_config_parses_a_real_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", valid_config()).unwrap();

        let mut settings = test_settings();
        settings.config_file = file.path().to_string_lossy().into_owned();
        let mut status = Status::new(settings);

        let next = actions::read_config(&mut status);
        assert_eq!(next, states::LOAD_PLUGIN);
        assert!(status.config.is_some());
    }

    #[test]
    fn read_config_missing_file_is_fatal() {
        let mut settings = test_settings();
        settings.config_file = "/nonexistent/config.json".to_string();
        let mut status = Status::new(settings);

        let next = actions::read_config(&mut status);
        assert_eq!(next, states::PARSE_ERROR);
        let next = actions::parse_error(&mut status);
        assert_eq!(next, states::CLEAR_MEMORY);
        assert_eq!(status.exit_code(), 1);
    }

    #[test]
    fn missing_plugin_library_is_fatal() {
        let mut settings = test_settings();
        settings.selection_library = Some("/nonexistent/libselect.so".to_string());
        let mut status = Status::new(settings);

        let next = actions::load_plugin(&mut status);
        assert_eq!(next, states::PLUGIN_ERROR);
        let next = actions::plugin_error(&mut status);
        assert_eq!(next, states::CLEAR_MEMORY);
        assert_eq!(status.exit_code(), 1);
    }

    #[test]
    fn shutdown_chain_releases_resources_in_order() {
        let mut status = Status::new(test_settings());
        status.config = Some(valid_config());
        status.context = Some(zmq::Context::new());

        assert_eq!(actions::clear_memory(&mut status), states::CLOSE_SOCKETS);
        assert!(status.config.is_none());
        assert_eq!(actions::close_sockets(&mut status), states::DESTROY_CONTEXT);
        assert_eq!(actions::destroy_context(&mut status), states::STOP);
        assert!(status.context.is_none());
    }

    #[test]
    fn state_ids_follow_the_conventions() {
        for state in [
            states::START,
            states::CREATE_CONTEXT,
            states::CREATE_SOCKETS,
            states::BIND_SOCKETS,
            states::READ_CONFIG,
            states::LOAD_PLUGIN,
        ] {
            assert!((100..200).contains(&state.id));
        }
        for state in [
            states::APPLY_CONFIG,
            states::PUBLISH_STATUS,
            states::RECEIVE_COMMANDS,
            states::READ_SOCKET,
        ] {
            assert!((200..300).contains(&state.id));
        }
        for state in [
            states::CLEAR_MEMORY,
            states::CLOSE_SOCKETS,
            states::DESTROY_CONTEXT,
            states::STOP,
        ] {
            assert!((800..900).contains(&state.id));
        }
        // Every error state has a distinct id.
        let error_ids = [
            states::COMMUNICATION_ERROR.id,
            states::PARSE_ERROR.id,
            states::CONFIGURE_ERROR.id,
            states::PLUGIN_ERROR.id,
        ];
        for id in error_ids {
            assert!((900..1000).contains(&id));
        }
        let mut unique = error_ids.to_vec();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), error_ids.len());
    }
}
