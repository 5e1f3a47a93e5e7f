//! Device side of the protocol: an in-memory register bank answering RTU
//! requests on a byte stream. Used by `regscope-slave` and by tests as a
//! stand-in for a field device.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use log::{debug, info};
use num_traits::FromPrimitive;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
    time::timeout,
};

use super::rtu::{self, ExceptionCode, FunctionCode};
use super::{ProtocolError, Result};

/// Silence after which a partially received frame is dropped.
const INTER_FRAME_GAP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub unit: u8,
    pub function: u8,
    pub address: u16,
    /// Register count for reads and multiple writes, the value for 0x06.
    pub count: u16,
    pub words: Vec<u16>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SlaveStats {
    pub served: usize,
    pub discarded: usize,
    /// Requests that arrived while another one was still unanswered.
    pub overlapped: usize,
}

pub struct Slave<S> {
    port: S,
    deq: VecDeque<u8>,
    buf: [u8; rtu::MAX_FRAME_LEN],
    stats: SlaveStats,
}

enum Fill {
    Ready,
    Gap,
    Closed,
}

impl<S> Slave<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(port: S) -> Self {
        Self {
            port,
            deq: VecDeque::new(),
            buf: [0u8; rtu::MAX_FRAME_LEN],
            stats: SlaveStats::default(),
        }
    }

    pub fn stats(&self) -> SlaveStats {
        self.stats
    }

    async fn ensure_buffer(&mut self, n: usize) -> Result<Fill> {
        while self.deq.len() < n {
            match timeout(INTER_FRAME_GAP, self.port.read(&mut self.buf)).await {
                Ok(Ok(0)) => return Ok(Fill::Closed),
                Ok(Ok(bytes_read)) => {
                    debug!("read {} bytes: {:02X?}", bytes_read, &self.buf[..bytes_read]);
                    self.deq.extend(&self.buf[..bytes_read]);
                }
                Ok(Err(e)) => return Err(ProtocolError::Connection(e.to_string())),
                Err(_) => return Ok(Fill::Gap),
            }
        }
        Ok(Fill::Ready)
    }

    fn discard(&mut self, n: usize) {
        let n = n.min(self.deq.len());
        self.deq.drain(..n);
        self.stats.discarded += n;
    }

    /// Waits for the next well-formed request. Returns `None` once the line
    /// is closed.
    pub async fn recv_request(&mut self) -> Result<Option<Request>> {
        loop {
            match self.ensure_buffer(2).await? {
                Fill::Ready => {}
                Fill::Closed => return Ok(None),
                Fill::Gap => {
                    let partial = self.deq.len();
                    self.discard(partial);
                    continue;
                }
            }

            let len = if self.deq[1] == FunctionCode::WriteMultipleRegisters as u8 {
                match self.ensure_buffer(7).await? {
                    Fill::Ready => 9 + self.deq[6] as usize,
                    Fill::Closed => return Ok(None),
                    Fill::Gap => {
                        debug!("incomplete header");
                        let partial = self.deq.len();
                        self.discard(partial);
                        continue;
                    }
                }
            } else {
                8
            };

            match self.ensure_buffer(len).await? {
                Fill::Ready => {}
                Fill::Closed => return Ok(None),
                Fill::Gap => {
                    debug!("incomplete frame");
                    let partial = self.deq.len();
                    self.discard(partial);
                    continue;
                }
            }

            let frame: Vec<u8> = self.deq.range(..len).copied().collect();
            let received = u16::from_le_bytes([frame[len - 2], frame[len - 1]]);
            if rtu::crc16(&frame[..len - 2]) != received {
                debug!("bad crc, resync");
                self.discard(1);
                continue;
            }

            self.deq.drain(..len);
            if !self.deq.is_empty() {
                self.stats.overlapped += 1;
            }

            let word = |i: usize| u16::from_be_bytes([frame[i], frame[i + 1]]);
            let words = if frame[1] == FunctionCode::WriteMultipleRegisters as u8 {
                frame[7..len - 2]
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect()
            } else {
                Vec::new()
            };

            return Ok(Some(Request {
                unit: frame[0],
                function: frame[1],
                address: word(2),
                count: word(4),
                words,
            }));
        }
    }

    pub async fn send_response(&mut self, frame: &[u8]) -> Result<()> {
        debug!("reply {:02X?}", frame);
        self.port
            .write_all(frame)
            .await
            .map_err(|e| ProtocolError::Connection(e.to_string()))?;
        self.stats.served += 1;
        Ok(())
    }
}

/// Register contents and fault injection for one simulated unit.
#[derive(Debug, Clone, Default)]
pub struct RegisterBank {
    unit: u8,
    words: BTreeMap<u16, u16>,
    faults: HashMap<u16, ExceptionCode>,
    silent: HashSet<u16>,
    mute: bool,
}

impl RegisterBank {
    pub fn new(unit: u8) -> Self {
        Self {
            unit,
            ..Default::default()
        }
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    /// Makes `words` readable and writable starting at `address`.
    pub fn set(&mut self, address: u16, words: &[u16]) {
        for (offset, &word) in words.iter().enumerate() {
            self.words.insert(address.wrapping_add(offset as u16), word);
        }
    }

    pub fn get(&self, address: u16) -> Option<u16> {
        self.words.get(&address).copied()
    }

    /// Any request touching `address` is answered with `code`.
    pub fn inject_fault(&mut self, address: u16, code: ExceptionCode) {
        self.faults.insert(address, code);
    }

    /// Any request touching `address` goes unanswered.
    pub fn silence(&mut self, address: u16) {
        self.silent.insert(address);
    }

    pub fn clear_faults(&mut self) {
        self.faults.clear();
        self.silent.clear();
    }

    /// Stops answering anything.
    pub fn set_mute(&mut self, mute: bool) {
        self.mute = mute;
    }

    fn check(&self, address: u16, count: u16) -> std::result::Result<(), Option<ExceptionCode>> {
        let span = address as u32..address as u32 + count as u32;
        for a in span {
            let a = a as u16;
            if self.silent.contains(&a) {
                return Err(None);
            }
            if let Some(&code) = self.faults.get(&a) {
                return Err(Some(code));
            }
            if !self.words.contains_key(&a) {
                return Err(Some(ExceptionCode::IllegalDataAddress));
            }
        }
        Ok(())
    }

    /// Applies `request` and builds the response frame. Broadcasts (unit 0)
    /// are applied without a response; requests for other units are ignored.
    pub fn handle(&mut self, request: &Request) -> Option<Vec<u8>> {
        let broadcast = request.unit == 0;
        if self.mute || (!broadcast && request.unit != self.unit) {
            return None;
        }

        let function = FunctionCode::from_u8(request.function);
        let span = match function {
            Some(FunctionCode::WriteSingleRegister) => 1,
            None => 0,
            Some(_) => request.count,
        };

        let outcome = match function {
            None => Err(Some(ExceptionCode::IllegalFunction)),
            Some(FunctionCode::WriteMultipleRegisters)
                if request.words.len() != request.count as usize =>
            {
                Err(Some(ExceptionCode::IllegalDataValue))
            }
            Some(_) if span == 0 || span > rtu::MAX_READ_WORDS => {
                Err(Some(ExceptionCode::IllegalDataValue))
            }
            Some(_) => self.check(request.address, span),
        };

        let response = match (function, outcome) {
            (_, Err(None)) => return None,
            (_, Err(Some(code))) => rtu::exception_response(self.unit, request.function, code),
            (Some(FunctionCode::ReadHoldingRegisters), Ok(()))
            | (Some(FunctionCode::ReadInputRegisters), Ok(())) => {
                let words: Vec<u16> = (0..request.count)
                    .filter_map(|offset| self.get(request.address.wrapping_add(offset)))
                    .collect();
                rtu::read_response(self.unit, request.function, &words)
            }
            (Some(FunctionCode::WriteSingleRegister), Ok(())) => {
                self.set(request.address, &[request.count]);
                rtu::echo_response(self.unit, request.function, request.address, request.count)
            }
            (Some(FunctionCode::WriteMultipleRegisters), Ok(())) => {
                self.set(request.address, &request.words);
                rtu::echo_response(self.unit, request.function, request.address, request.count)
            }
            (None, Ok(())) => return None,
        };

        (!broadcast).then(|| response)
    }
}

/// Answers requests on `port` from `bank` until the line closes.
pub async fn serve<S>(port: S, bank: Arc<Mutex<RegisterBank>>) -> Result<SlaveStats>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut slave = Slave::new(port);

    while let Some(request) = slave.recv_request().await? {
        debug!("request {:?}", request);
        let response = bank.lock().await.handle(&request);
        if let Some(frame) = response {
            slave.send_response(&frame).await?;
        }
    }

    info!("line closed, {:?}", slave.stats());
    Ok(slave.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn read(unit: u8, address: u16, count: u16) -> Request {
        Request {
            unit,
            function: 0x03,
            address,
            count,
            words: vec![],
        }
    }

    #[test]
    fn bank_reads_and_writes() {
        let mut bank = RegisterBank::new(1);
        bank.set(100, &[0x4248, 0x0000]);

        assert_eq!(
            bank.handle(&read(1, 100, 2)),
            Some(rtu::read_response(1, 0x03, &[0x4248, 0x0000]))
        );

        let write = Request {
            unit: 1,
            function: 0x10,
            address: 100,
            count: 2,
            words: vec![1, 2],
        };
        assert_eq!(bank.handle(&write), Some(rtu::echo_response(1, 0x10, 100, 2)));
        assert_eq!(bank.get(101), Some(2));
    }

    #[test]
    fn bank_exceptions() {
        let mut bank = RegisterBank::new(1);
        bank.set(0, &[1, 2, 3]);
        bank.inject_fault(2, ExceptionCode::SlaveDeviceFailure);

        assert_eq!(
            bank.handle(&read(1, 5, 1)),
            Some(rtu::exception_response(1, 0x03, ExceptionCode::IllegalDataAddress))
        );
        assert_eq!(
            bank.handle(&read(1, 1, 2)),
            Some(rtu::exception_response(1, 0x03, ExceptionCode::SlaveDeviceFailure))
        );

        let mut unknown = read(1, 0, 1);
        unknown.function = 0x2B;
        assert_eq!(
            bank.handle(&unknown),
            Some(rtu::exception_response(1, 0x2B, ExceptionCode::IllegalFunction))
        );
    }

    #[test]
    fn bank_ignores_other_units_and_answers_no_broadcast() {
        let mut bank = RegisterBank::new(1);
        bank.set(0, &[7]);
        assert_eq!(bank.handle(&read(2, 0, 1)), None);

        let broadcast = Request {
            unit: 0,
            function: 0x06,
            address: 0,
            count: 9,
            words: vec![],
        };
        assert_eq!(bank.handle(&broadcast), None);
        assert_eq!(bank.get(0), Some(9));

        bank.set_mute(true);
        assert_eq!(bank.handle(&read(1, 0, 1)), None);
    }

    #[tokio::test]
    async fn recv_resyncs_after_garbage() {
        let (near, mut far) = duplex(256);
        let mut slave = Slave::new(near);

        let mut bytes = vec![0xAA];
        bytes.extend(rtu::read_request(1, FunctionCode::ReadHoldingRegisters, 4, 2));
        far.write_all(&bytes).await.unwrap();

        let request = slave.recv_request().await.unwrap().unwrap();
        assert_eq!(request, read(1, 4, 2));
        assert_eq!(slave.stats().discarded, 1);

        far.write_all(&rtu::write_multiple_request(1, 8, &[5, 6, 7]))
            .await
            .unwrap();
        let request = slave.recv_request().await.unwrap().unwrap();
        assert_eq!(request.function, 0x10);
        assert_eq!(request.count, 3);
        assert_eq!(request.words, vec![5, 6, 7]);

        drop(far);
        assert_eq!(slave.recv_request().await, Ok(None));
    }

    #[tokio::test]
    async fn serve_until_closed() {
        let (near, mut far) = duplex(256);
        let mut bank = RegisterBank::new(1);
        bank.set(0, &[42]);
        let task = tokio::spawn(serve(near, Arc::new(Mutex::new(bank))));

        far.write_all(&rtu::read_request(1, FunctionCode::ReadHoldingRegisters, 0, 1))
            .await
            .unwrap();
        let mut response = [0u8; 7];
        far.read_exact(&mut response).await.unwrap();
        assert_eq!(response, [0x01, 0x03, 0x02, 0x00, 0x2A, 0x39, 0x9B]);

        drop(far);
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.served, 1);
        assert_eq!(stats.discarded, 0);
    }
}
