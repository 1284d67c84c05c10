//! Pure Rust implementation of the RTDE (Real-Time Data Exchange) protocol
//! Based on Universal Robots' official RTDE specification

use crate::config::Config;
use crate::recipe::{Recipe, RecipeSource};
use crate::state::StateFrame;
use crate::{Error, Result};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const RTDE_PROTOCOL_VERSION: u16 = 2;
const HEADER_SIZE: usize = 3;
/// Data packages tolerated while waiting for a control reply (2 s at 125 Hz)
const MAX_SKIPPED_PACKAGES: usize = 250;

/// RTDE message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RTDEMessage {
    RequestProtocolVersion = 86,
    GetUrControlVersion = 118,
    TextMessage = 77,
    DataPackage = 85,
    ControlPackageSetupOutputs = 79,
    ControlPackageSetupInputs = 73,
    ControlPackageStart = 83,
    ControlPackagePause = 80,
}

impl RTDEMessage {
    fn from_byte(raw: u8) -> Option<Self> {
        Some(match raw {
            86 => RTDEMessage::RequestProtocolVersion,
            118 => RTDEMessage::GetUrControlVersion,
            77 => RTDEMessage::TextMessage,
            85 => RTDEMessage::DataPackage,
            79 => RTDEMessage::ControlPackageSetupOutputs,
            73 => RTDEMessage::ControlPackageSetupInputs,
            83 => RTDEMessage::ControlPackageStart,
            80 => RTDEMessage::ControlPackagePause,
            _ => return None,
        })
    }
}

/// Scalar element of an RTDE wire type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scalar {
    Bool,
    U8,
    U32,
    U64,
    I32,
    F64,
}

impl Scalar {
    fn size(self) -> usize {
        match self {
            Scalar::Bool | Scalar::U8 => 1,
            Scalar::U32 | Scalar::I32 => 4,
            Scalar::U64 | Scalar::F64 => 8,
        }
    }

    /// Decode one big-endian element; `bytes` is exactly `size()` long
    fn read(self, bytes: &[u8]) -> f64 {
        match self {
            Scalar::Bool | Scalar::U8 => bytes[0] as f64,
            Scalar::U32 => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
            Scalar::I32 => i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
            Scalar::U64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                u64::from_be_bytes(raw) as f64
            }
            Scalar::F64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                f64::from_be_bytes(raw)
            }
        }
    }
}

/// Element type and count for a named RTDE wire type
fn field_layout(var_type: &str) -> Option<(Scalar, usize)> {
    Some(match var_type {
        "BOOL" => (Scalar::Bool, 1),
        "UINT8" => (Scalar::U8, 1),
        "UINT32" => (Scalar::U32, 1),
        "UINT64" => (Scalar::U64, 1),
        "INT32" => (Scalar::I32, 1),
        "DOUBLE" => (Scalar::F64, 1),
        "VECTOR3D" => (Scalar::F64, 3),
        "VECTOR6D" => (Scalar::F64, 6),
        "VECTOR6INT32" => (Scalar::I32, 6),
        "VECTOR6UINT32" => (Scalar::U32, 6),
        _ => return None,
    })
}

/// Parse binary data according to variable types
///
/// Every value is widened to `f64`, which is exact for all the integer
/// widths a state recipe uses.
pub fn parse_data_package(
    variables: &[String],
    variable_types: &[String],
    data: &[u8],
) -> Result<HashMap<String, Vec<f64>>> {
    let mut result = HashMap::with_capacity(variables.len());
    let mut offset = 0;

    for (var_name, var_type) in variables.iter().zip(variable_types) {
        let (scalar, count) = field_layout(var_type)
            .ok_or_else(|| Error::Decode(format!("Unsupported variable type: {}", var_type)))?;

        let width = scalar.size() * count;
        if offset + width > data.len() {
            return Err(Error::Decode(format!(
                "Insufficient data for {} ({}): need {} bytes at offset {}, have {}",
                var_name,
                var_type,
                width,
                offset,
                data.len()
            )));
        }

        let values = data[offset..offset + width]
            .chunks_exact(scalar.size())
            .map(|chunk| scalar.read(chunk))
            .collect();
        result.insert(var_name.clone(), values);
        offset += width;
    }

    if offset != data.len() {
        return Err(Error::Decode(format!(
            "Data package has {} trailing bytes",
            data.len() - offset
        )));
    }

    Ok(result)
}

/// RTDE Client for communicating with Universal Robots
pub struct RTDEClient {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    protocol_version: Option<u16>,
    recipe_id: Option<u8>,
    variables: Vec<String>,
    variable_types: Vec<String>,
}

impl RTDEClient {
    /// Create a new RTDE client
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            stream: None,
            protocol_version: None,
            recipe_id: None,
            variables: Vec::new(),
            variable_types: Vec::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn protocol_version(&self) -> Option<u16> {
        self.protocol_version
    }

    /// Connect to the RTDE interface
    pub fn connect(&mut self, connect_timeout: Duration, io_timeout: Duration) -> Result<()> {
        let endpoint = self.endpoint();
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| Error::transport(&endpoint, e))?
            .next()
            .ok_or_else(|| Error::Config(format!("Could not resolve {}", endpoint)))?;

        let stream = TcpStream::connect_timeout(&addr, connect_timeout).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                Error::timeout(&endpoint, "connect")
            } else {
                Error::transport(&endpoint, e)
            }
        })?;

        stream.set_nodelay(true).map_err(|e| Error::transport(&endpoint, e))?;
        stream.set_read_timeout(Some(io_timeout)).map_err(|e| Error::transport(&endpoint, e))?;
        stream.set_write_timeout(Some(io_timeout)).map_err(|e| Error::transport(&endpoint, e))?;

        self.stream = Some(stream);
        debug!("RTDE socket open to {}", endpoint);
        Ok(())
    }

    /// Send an RTDE message
    fn send_message(&mut self, msg_type: RTDEMessage, payload: &[u8]) -> Result<()> {
        let endpoint = self.endpoint();
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        let size = u16::try_from(payload.len() + HEADER_SIZE)
            .map_err(|_| Error::Negotiation(format!("Payload too large for {:?}", msg_type)))?;

        let mut packet = Vec::with_capacity(size as usize);
        packet.extend_from_slice(&size.to_be_bytes());
        packet.push(msg_type as u8);
        packet.extend_from_slice(payload);

        stream.write_all(&packet).map_err(|e| Error::transport(endpoint, e))
    }

    /// Receive an RTDE message
    ///
    /// A timeout before the first byte of a packet is `Error::Timeout`. Once
    /// any byte is consumed the rest of the packet must follow within the
    /// read timeout, otherwise the stream is out of step and the failure is
    /// a transport error.
    fn receive_message(&mut self) -> Result<(RTDEMessage, Vec<u8>)> {
        let endpoint = self.endpoint();
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        let mut header = [0u8; HEADER_SIZE];
        loop {
            match stream.read(&mut header[..1]) {
                Ok(0) => return Err(Error::transport(&endpoint, io::Error::from(io::ErrorKind::UnexpectedEof))),
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return Err(Error::timeout(&endpoint, "receive"));
                }
                Err(e) => return Err(Error::transport(&endpoint, e)),
            }
        }
        read_within_packet(stream, &mut header[1..], &endpoint)?;

        let size = u16::from_be_bytes([header[0], header[1]]) as usize;
        if size < HEADER_SIZE {
            // Framing is lost; nothing after this can be trusted
            return Err(Error::transport(
                &endpoint,
                io::Error::new(io::ErrorKind::InvalidData, format!("packet size {} smaller than header", size)),
            ));
        }

        let mut payload = vec![0u8; size - HEADER_SIZE];
        read_within_packet(stream, &mut payload, &endpoint)?;

        // Payload is consumed before classifying, so an unknown type leaves the stream aligned
        let msg_type = RTDEMessage::from_byte(header[2])
            .ok_or_else(|| Error::Decode(format!("Unknown message type: {}", header[2])))?;

        Ok((msg_type, payload))
    }

    /// Receive the reply to a control request, logging any text messages in between
    fn receive_reply(&mut self, expected: RTDEMessage) -> Result<Vec<u8>> {
        let mut skipped = 0;
        loop {
            let (msg_type, payload) = self.receive_message()?;
            if msg_type == expected {
                return Ok(payload);
            }
            if msg_type == RTDEMessage::TextMessage {
                log_text_message(&payload);
                continue;
            }
            if msg_type == RTDEMessage::DataPackage {
                skipped += 1;
                if skipped > MAX_SKIPPED_PACKAGES {
                    return Err(Error::Negotiation(format!(
                        "No {:?} reply after {} data packages",
                        expected, MAX_SKIPPED_PACKAGES
                    )));
                }
                debug!("Skipping data package while waiting for {:?}", expected);
                continue;
            }
            return Err(Error::Negotiation(format!(
                "Expected {:?} reply, got {:?}",
                expected, msg_type
            )));
        }
    }

    /// Negotiate protocol version
    pub fn negotiate_protocol_version(&mut self, requested_version: u16) -> Result<()> {
        self.send_message(RTDEMessage::RequestProtocolVersion, &requested_version.to_be_bytes())?;

        let payload = self.receive_reply(RTDEMessage::RequestProtocolVersion)?;
        if payload.first() == Some(&1) {
            self.protocol_version = Some(requested_version);
            return Ok(());
        }

        Err(Error::Negotiation(format!(
            "Controller rejected protocol version {}",
            requested_version
        )))
    }

    /// Setup output recipe (configure what data to receive)
    ///
    /// Returns the wire types the controller assigned to each variable.
    pub fn setup_output_recipe(&mut self, variables: &[String], frequency: f64) -> Result<Vec<String>> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&frequency.to_be_bytes());
        payload.extend_from_slice(variables.join(",").as_bytes());

        self.send_message(RTDEMessage::ControlPackageSetupOutputs, &payload)?;
        let response = self.receive_reply(RTDEMessage::ControlPackageSetupOutputs)?;

        let (recipe_id, types) = response
            .split_first()
            .ok_or_else(|| Error::Negotiation("Empty output setup reply".to_string()))?;

        let types: Vec<String> = String::from_utf8_lossy(types)
            .split(',')
            .map(|s| s.trim().to_string())
            .collect();

        if types.len() != variables.len() {
            return Err(Error::Negotiation(format!(
                "Controller returned {} types for {} variables",
                types.len(),
                variables.len()
            )));
        }
        if let Some(index) = types.iter().position(|t| t == "NOT_FOUND") {
            return Err(Error::Negotiation(format!(
                "Variable '{}' is not available on this controller",
                variables[index]
            )));
        }
        if *recipe_id == 0 {
            return Err(Error::Negotiation("Controller refused the output recipe".to_string()));
        }

        self.recipe_id = Some(*recipe_id);
        self.variables = variables.to_vec();
        self.variable_types = types.clone();
        Ok(types)
    }

    /// Start data synchronization
    pub fn start_data_synchronization(&mut self) -> Result<()> {
        self.send_message(RTDEMessage::ControlPackageStart, &[])?;

        let payload = self.receive_reply(RTDEMessage::ControlPackageStart)?;
        if payload.first() == Some(&1) {
            return Ok(());
        }

        Err(Error::Negotiation("Failed to start data synchronization".to_string()))
    }

    /// Pause data synchronization
    pub fn pause(&mut self) -> Result<()> {
        self.send_message(RTDEMessage::ControlPackagePause, &[])?;

        let payload = self.receive_reply(RTDEMessage::ControlPackagePause)?;
        if payload.first() == Some(&1) {
            return Ok(());
        }

        Err(Error::Negotiation("Failed to pause data synchronization".to_string()))
    }

    /// Read and parse a data package
    pub fn read_data_package(&mut self) -> Result<HashMap<String, Vec<f64>>> {
        loop {
            let (msg_type, payload) = self.receive_message()?;

            match msg_type {
                RTDEMessage::DataPackage => {
                    let (recipe_id, data) = payload
                        .split_first()
                        .ok_or_else(|| Error::Decode("Empty data package".to_string()))?;

                    if Some(*recipe_id) != self.recipe_id {
                        return Err(Error::Decode(format!(
                            "Data package for unknown recipe {}",
                            recipe_id
                        )));
                    }

                    return parse_data_package(&self.variables, &self.variable_types, data);
                }
                RTDEMessage::TextMessage => log_text_message(&payload),
                other => return Err(Error::Decode(format!("Expected data package, got {:?}", other))),
            }
        }
    }

    /// Close the connection, pausing the stream first if possible
    pub fn disconnect(&mut self) {
        if self.stream.is_some() {
            if let Err(e) = self.pause() {
                debug!("RTDE pause before disconnect failed: {}", e);
            }
        }
        self.stream = None;
        self.recipe_id = None;
    }
}

/// Fill `buf` with the remainder of a packet that has already started
fn read_within_packet(stream: &mut TcpStream, buf: &mut [u8], endpoint: &str) -> Result<()> {
    stream.read_exact(buf).map_err(|e| {
        Error::transport(
            endpoint,
            io::Error::new(e.kind(), format!("stream stalled mid-packet: {}", e)),
        )
    })
}

/// Log a controller text message (`M` packet, protocol v2 layout)
fn log_text_message(payload: &[u8]) {
    let take = |offset: usize| -> Option<(String, usize)> {
        let len = *payload.get(offset)? as usize;
        let text = payload.get(offset + 1..offset + 1 + len)?;
        Some((String::from_utf8_lossy(text).into_owned(), offset + 1 + len))
    };

    let parsed = take(0).and_then(|(message, next)| {
        let (source, next) = take(next)?;
        Some((message, source, *payload.get(next)?))
    });

    match parsed {
        Some((message, source, 0)) | Some((message, source, 1)) => error!("[{}] {}", source, message),
        Some((message, source, 2)) => warn!("[{}] {}", source, message),
        Some((message, source, _)) => info!("[{}] {}", source, message),
        None => debug!("Controller text message: {}", String::from_utf8_lossy(payload)),
    }
}

/// Everything needed to open a telemetry session
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub recipe: String,
    pub frequency_hz: f64,
    pub pose_field: String,
    pub status_field: String,
}

impl LinkSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.robot.host.clone(),
            port: config.robot.rtde_port,
            connect_timeout: config.robot.connect_timeout(),
            io_timeout: config.robot.read_timeout(),
            recipe: config.telemetry.recipe.clone(),
            frequency_hz: config.telemetry.frequency_hz,
            pose_field: config.telemetry.pose_field.clone(),
            status_field: config.telemetry.status_field.clone(),
        }
    }
}

/// A negotiated, streaming RTDE session yielding one [`StateFrame`] per cycle
pub struct TelemetrySession {
    client: RTDEClient,
    pose_field: String,
    status_field: String,
}

impl TelemetrySession {
    /// Parse the recipe, open the socket, negotiate outputs and start streaming.
    ///
    /// Each step is fail-fast; on any failure the socket is dropped and no
    /// partial session survives.
    pub fn connect(settings: &LinkSettings, recipes: &dyn RecipeSource) -> Result<Self> {
        let recipe = recipes.recipe(&settings.recipe)?;
        for field in [&settings.pose_field, &settings.status_field] {
            if !recipe.contains(field) {
                return Err(Error::Recipe(format!(
                    "Recipe '{}' does not include required field '{}'",
                    settings.recipe, field
                )));
            }
        }

        let mut client = RTDEClient::new(&settings.host, settings.port);
        client.connect(settings.connect_timeout, settings.io_timeout)?;
        client.negotiate_protocol_version(RTDE_PROTOCOL_VERSION)?;

        let types = client.setup_output_recipe(&recipe.names, settings.frequency_hz)?;
        check_types(&recipe, &types)?;

        client.start_data_synchronization()?;
        info!(
            "RTDE streaming '{}' from {}:{} at {}Hz",
            settings.recipe, settings.host, settings.port, settings.frequency_hz
        );

        Ok(Self {
            client,
            pose_field: settings.pose_field.clone(),
            status_field: settings.status_field.clone(),
        })
    }

    /// Block until the controller pushes the next synchronized frame
    pub fn receive(&mut self) -> Result<StateFrame> {
        let data = self.client.read_data_package()?;
        StateFrame::from_fields(&data, &self.pose_field, &self.status_field)
    }

    pub fn disconnect(mut self) {
        self.client.disconnect();
        info!("RTDE session closed");
    }
}

fn check_types(recipe: &Recipe, negotiated: &[String]) -> Result<()> {
    for ((name, expected), actual) in recipe.names.iter().zip(&recipe.types).zip(negotiated) {
        if expected != actual {
            return Err(Error::Negotiation(format!(
                "Data type inconsistency for '{}': descriptor says {}, controller says {}",
                name, expected, actual
            )));
        }
    }
    Ok(())
}
