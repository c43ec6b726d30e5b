use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use rmodbus::{client::ModbusRequest, guess_response_frame_len, ModbusProto};
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use thiserror::Error;

use crate::modbus::types::{AddressRange, RegisterType};

/// Transport failures, classified the way the executor and the watchdog
/// consume them. The transport itself never retries.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("context: {0}")]
    Context(String),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Blocking register access for one Modbus network. Coils and discrete
/// inputs are normalized to one bit per `u16` on read and packed back on
/// write.
pub trait Transport: Send {
    fn connect(&mut self) -> TransportResult<()>;
    fn is_connected(&self) -> bool;
    fn disconnect(&mut self);
    fn read(&mut self, slave_id: u8, range: &AddressRange) -> TransportResult<Vec<u16>>;
    fn write(
        &mut self,
        slave_id: u8,
        range: &AddressRange,
        values: &[u16],
    ) -> TransportResult<()>;
    /// Device path watched by the watchdog, when the medium has one.
    fn device_path(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtuSerialMode {
    Unspecified,
    Rs232,
    Rs485,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtuRtsMode {
    None,
    Up,
    Down,
}

#[derive(Debug, Clone)]
pub struct RtuSettings {
    pub device: String,
    pub baud: u32,
    pub parity: char,
    pub data_bit: u8,
    pub stop_bit: u8,
    pub serial_mode: RtuSerialMode,
    pub rts_mode: RtuRtsMode,
    pub rts_delay_us: u32,
    pub response_timeout: Duration,
    pub response_data_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TcpSettings {
    pub address: String,
    pub port: u16,
    pub response_timeout: Duration,
}

fn generate_read_request(
    mreq: &mut ModbusRequest,
    range: &AddressRange,
    request: &mut Vec<u8>,
) -> TransportResult<()> {
    let result = match range.reg_type {
        RegisterType::Coil => mreq.generate_get_coils(range.first, range.count, request),
        RegisterType::DiscreteInput => {
            mreq.generate_get_discretes(range.first, range.count, request)
        }
        RegisterType::Holding => mreq.generate_get_holdings(range.first, range.count, request),
        RegisterType::Input => mreq.generate_get_inputs(range.first, range.count, request),
    };
    result.map_err(|e| TransportError::Read(format!("request for {range}: {e:?}")))
}

fn generate_write_request(
    mreq: &mut ModbusRequest,
    range: &AddressRange,
    values: &[u16],
    request: &mut Vec<u8>,
) -> TransportResult<()> {
    if values.len() != usize::from(range.count) {
        return Err(TransportError::Write(format!(
            "value count {} does not match range {range}",
            values.len()
        )));
    }
    let result = match range.reg_type {
        RegisterType::Coil => {
            if range.count == 1 {
                mreq.generate_set_coil(range.first, values[0] != 0, request)
            } else {
                let bits: Vec<bool> = values.iter().map(|&v| v != 0).collect();
                mreq.generate_set_coils_bulk(range.first, &bits, request)
            }
        }
        RegisterType::Holding => {
            if range.count == 1 {
                mreq.generate_set_holding(range.first, values[0], request)
            } else {
                mreq.generate_set_holdings_bulk(range.first, values, request)
            }
        }
        RegisterType::DiscreteInput | RegisterType::Input => {
            return Err(TransportError::Write(format!(
                "register type {} is not writable",
                range.reg_type
            )));
        }
    };
    result.map_err(|e| TransportError::Write(format!("request for {range}: {e:?}")))
}

fn parse_read_response(
    mreq: &ModbusRequest,
    range: &AddressRange,
    response: &[u8],
) -> TransportResult<Vec<u16>> {
    if range.reg_type.is_bit() {
        let mut bits: Vec<bool> = Vec::new();
        mreq.parse_bool(response, &mut bits)
            .map_err(|e| TransportError::Read(format!("response for {range}: {e:?}")))?;
        bits.truncate(usize::from(range.count));
        Ok(bits.into_iter().map(u16::from).collect())
    } else {
        let mut values: Vec<u16> = Vec::new();
        mreq.parse_u16(response, &mut values)
            .map_err(|e| TransportError::Read(format!("response for {range}: {e:?}")))?;
        Ok(values)
    }
}

/// Read one full response frame from a byte stream. The header prefix is
/// enough for `guess_response_frame_len` to size the rest.
fn read_response_frame<S: Read>(
    stream: &mut S,
    proto: ModbusProto,
) -> std::io::Result<Vec<u8>> {
    let header_len = match proto {
        ModbusProto::TcpUdp => 6,
        _ => 3,
    };
    let mut header = vec![0u8; header_len];
    stream.read_exact(&mut header)?;
    let frame_len = guess_response_frame_len(&header, proto).map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{e:?}"))
    })?;
    let mut response = header;
    if usize::from(frame_len) > response.len() {
        let mut rest = vec![0u8; usize::from(frame_len) - response.len()];
        stream.read_exact(&mut rest)?;
        response.extend_from_slice(&rest);
    }
    Ok(response)
}

/// RTU over a serial line via `serialport`, frames built and parsed with
/// `rmodbus`.
pub struct RtuTransport {
    settings: RtuSettings,
    port: Option<Box<dyn SerialPort>>,
}

impl RtuTransport {
    pub fn new(settings: RtuSettings) -> Self {
        RtuTransport {
            settings,
            port: None,
        }
    }

    fn parity(&self) -> TransportResult<Parity> {
        match self.settings.parity.to_ascii_uppercase() {
            'N' => Ok(Parity::None),
            'E' => Ok(Parity::Even),
            'O' => Ok(Parity::Odd),
            other => Err(TransportError::Context(format!("unknown parity '{other}'"))),
        }
    }

    fn data_bits(&self) -> TransportResult<DataBits> {
        match self.settings.data_bit {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(TransportError::Context(format!(
                "unsupported data bits {other}"
            ))),
        }
    }

    fn stop_bits(&self) -> TransportResult<StopBits> {
        match self.settings.stop_bit {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            other => Err(TransportError::Context(format!(
                "unsupported stop bits {other}"
            ))),
        }
    }

    fn send_request(&mut self, request: &[u8]) -> std::io::Result<()> {
        let rts_mode = self.settings.rts_mode;
        let rts_delay = Duration::from_micros(u64::from(self.settings.rts_delay_us));
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))?;
        port.clear(ClearBuffer::Input)
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        if rts_mode != RtuRtsMode::None {
            let level = rts_mode == RtuRtsMode::Up;
            port.write_request_to_send(level)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            std::thread::sleep(rts_delay);
        }
        port.write_all(request)?;
        port.flush()?;
        if rts_mode != RtuRtsMode::None {
            std::thread::sleep(rts_delay);
            let level = rts_mode == RtuRtsMode::Up;
            port.write_request_to_send(!level)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
        }
        Ok(())
    }

    fn receive_response(&mut self) -> std::io::Result<Vec<u8>> {
        let data_timeout = self.settings.response_data_timeout;
        let response_timeout = self.settings.response_timeout;
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))?;
        // the first bytes wait for the device to answer, the rest only for
        // the line to keep moving
        if !data_timeout.is_zero() {
            let _ = port.set_timeout(response_timeout);
        }
        let mut header = [0u8; 3];
        port.read_exact(&mut header)?;
        if !data_timeout.is_zero() {
            let _ = port.set_timeout(data_timeout);
        }
        let frame_len = guess_response_frame_len(&header, ModbusProto::Rtu).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{e:?}"))
        })?;
        let mut response = header.to_vec();
        if usize::from(frame_len) > response.len() {
            let mut rest = vec![0u8; usize::from(frame_len) - response.len()];
            port.read_exact(&mut rest)?;
            response.extend_from_slice(&rest);
        }
        Ok(response)
    }
}

impl Transport for RtuTransport {
    fn connect(&mut self) -> TransportResult<()> {
        if self.port.is_some() {
            return Ok(());
        }
        if self.settings.serial_mode == RtuSerialMode::Rs485 {
            log::warn!(
                "rs485 serial mode is driver-dependent, relying on rts control for direction"
            );
        }
        let port = serialport::new(&self.settings.device, self.settings.baud)
            .parity(self.parity()?)
            .data_bits(self.data_bits()?)
            .stop_bits(self.stop_bits()?)
            .timeout(self.settings.response_timeout)
            .open()
            .map_err(|e| {
                TransportError::Context(format!("open {}: {e}", self.settings.device))
            })?;
        log::info!(
            "rtu connected: {}, {}-{}{}{}",
            self.settings.device,
            self.settings.baud,
            self.settings.data_bit,
            self.settings.parity,
            self.settings.stop_bit
        );
        self.port = Some(port);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn disconnect(&mut self) {
        self.port = None;
    }

    fn read(&mut self, slave_id: u8, range: &AddressRange) -> TransportResult<Vec<u16>> {
        let mut mreq = ModbusRequest::new(slave_id, ModbusProto::Rtu);
        let mut request = Vec::new();
        generate_read_request(&mut mreq, range, &mut request)?;
        self.send_request(&request)
            .map_err(|e| TransportError::Read(format!("{range}: {e}")))?;
        let response = self
            .receive_response()
            .map_err(|e| TransportError::Read(format!("{range}: {e}")))?;
        parse_read_response(&mreq, range, &response)
    }

    fn write(
        &mut self,
        slave_id: u8,
        range: &AddressRange,
        values: &[u16],
    ) -> TransportResult<()> {
        let mut mreq = ModbusRequest::new(slave_id, ModbusProto::Rtu);
        let mut request = Vec::new();
        generate_write_request(&mut mreq, range, values, &mut request)?;
        self.send_request(&request)
            .map_err(|e| TransportError::Write(format!("{range}: {e}")))?;
        let response = self
            .receive_response()
            .map_err(|e| TransportError::Write(format!("{range}: {e}")))?;
        mreq.parse_ok(&response)
            .map_err(|e| TransportError::Write(format!("response for {range}: {e:?}")))
    }

    fn device_path(&self) -> Option<&str> {
        Some(&self.settings.device)
    }
}

/// Modbus TCP over a plain `TcpStream`.
pub struct TcpTransport {
    settings: TcpSettings,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(settings: TcpSettings) -> Self {
        TcpTransport {
            settings,
            stream: None,
        }
    }

    fn resolve(&self) -> TransportResult<SocketAddr> {
        let target = format!("{}:{}", self.settings.address, self.settings.port);
        target
            .to_socket_addrs()
            .map_err(|e| TransportError::Context(format!("resolve {target}: {e}")))?
            .next()
            .ok_or_else(|| TransportError::Context(format!("no address for {target}")))
    }

    fn exchange(&mut self, request: &[u8]) -> std::io::Result<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "not connected")
        })?;
        stream.write_all(request)?;
        stream.flush()?;
        read_response_frame(stream, ModbusProto::TcpUdp)
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self) -> TransportResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addr = self.resolve()?;
        let timeout = if self.settings.response_timeout.is_zero() {
            Duration::from_secs(3)
        } else {
            self.settings.response_timeout
        };
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| TransportError::Context(format!("connect {addr}: {e}")))?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| TransportError::Context(e.to_string()))?;
        stream
            .set_write_timeout(Some(timeout))
            .map_err(|e| TransportError::Context(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::Context(e.to_string()))?;
        log::info!("tcp connected: {addr}");
        self.stream = Some(stream);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn disconnect(&mut self) {
        self.stream = None;
    }

    fn read(&mut self, slave_id: u8, range: &AddressRange) -> TransportResult<Vec<u16>> {
        let mut mreq = ModbusRequest::new(slave_id, ModbusProto::TcpUdp);
        let mut request = Vec::new();
        generate_read_request(&mut mreq, range, &mut request)?;
        let response = self
            .exchange(&request)
            .map_err(|e| TransportError::Read(format!("{range}: {e}")))?;
        parse_read_response(&mreq, range, &response)
    }

    fn write(
        &mut self,
        slave_id: u8,
        range: &AddressRange,
        values: &[u16],
    ) -> TransportResult<()> {
        let mut mreq = ModbusRequest::new(slave_id, ModbusProto::TcpUdp);
        let mut request = Vec::new();
        generate_write_request(&mut mreq, range, values, &mut request)?;
        let response = self
            .exchange(&request)
            .map_err(|e| TransportError::Write(format!("{range}: {e}")))?;
        mreq.parse_ok(&response)
            .map_err(|e| TransportError::Write(format!("response for {range}: {e:?}")))
    }
}
