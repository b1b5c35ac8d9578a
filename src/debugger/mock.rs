//! In-memory stand-in for a live debuggee, used by unit tests.

use crate::debugger::address::RelocatedAddress;
use crate::debugger::error::Error;
use crate::debugger::process::ProcessAccess;
use crate::debugger::register::{Register, RegisterFile};
use std::collections::HashMap;

#[derive(Default)]
pub struct FakeProcess {
    memory: HashMap<u32, u8>,
    registers: HashMap<u32, RegisterFile>,
}

impl FakeProcess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_bytes(&mut self, addr: u32, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.memory.insert(addr + i as u32, *byte);
        }
    }

    pub fn byte_at(&self, addr: u32) -> u8 {
        self.memory[&addr]
    }
}

impl ProcessAccess for FakeProcess {
    fn read_memory(&self, addr: RelocatedAddress, size: usize) -> Result<Vec<u8>, Error> {
        let base = addr.as_u32();
        let mut out = Vec::with_capacity(size);
        for i in 0..size {
            match self.memory.get(&(base + i as u32)) {
                Some(byte) => out.push(*byte),
                None => {
                    return Err(Error::MemoryRead {
                        addr,
                        size,
                        code: 299,
                    })
                }
            }
        }
        Ok(out)
    }

    fn write_memory(&mut self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
        let base = addr.as_u32();
        for i in 0..data.len() {
            if !self.memory.contains_key(&(base + i as u32)) {
                return Err(Error::MemoryWrite {
                    addr,
                    size: data.len(),
                    code: 299,
                });
            }
        }
        for (i, byte) in data.iter().enumerate() {
            self.memory.insert(base + i as u32, *byte);
        }
        Ok(())
    }

    fn register(&self, thread_id: u32, register: Register) -> Result<u32, Error> {
        let file = self
            .registers
            .get(&thread_id)
            .ok_or(Error::ThreadNotFound(thread_id))?;
        Ok(file.value(register))
    }

    fn set_register(
        &mut self,
        thread_id: u32,
        register: Register,
        value: u32,
    ) -> Result<(), Error> {
        self.registers
            .entry(thread_id)
            .or_default()
            .update(register, value);
        Ok(())
    }

    fn registers(&self, thread_id: u32) -> Result<RegisterFile, Error> {
        self.registers
            .get(&thread_id)
            .copied()
            .ok_or(Error::ThreadNotFound(thread_id))
    }
}
