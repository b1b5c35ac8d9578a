use crate::debugger::address::RelocatedAddress;
use crate::debugger::error::Error;
use crate::debugger::register::{Register, RegisterFile};

/// Typed memory and register access to a live debuggee.
///
/// The debug-event dispatcher, breakpoint engine and variable inspector are
/// written against this trait so their policy is host-independent (and
/// testable with a fake process).
pub trait ProcessAccess {
    fn read_memory(&self, addr: RelocatedAddress, size: usize) -> Result<Vec<u8>, Error>;

    fn write_memory(&mut self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error>;

    fn register(&self, thread_id: u32, register: Register) -> Result<u32, Error>;

    fn set_register(&mut self, thread_id: u32, register: Register, value: u32)
        -> Result<(), Error>;

    fn registers(&self, thread_id: u32) -> Result<RegisterFile, Error>;

    fn read_byte(&self, addr: RelocatedAddress) -> Result<u8, Error> {
        Ok(self.read_memory(addr, 1)?[0])
    }
}

#[cfg(windows)]
pub use self::windows::ProcessController;

#[cfg(windows)]
mod windows {
    use super::ProcessAccess;
    use crate::debugger::address::RelocatedAddress;
    use crate::debugger::error::Error;
    use crate::debugger::register::{Register, RegisterFile};
    use crate::debugger::sys;
    use std::collections::HashMap;
    use winapi::um::winnt::HANDLE;

    /// Owner of the debuggee process and per-thread handles.
    ///
    /// All handles here are plain kernel object handles, usable from any
    /// thread. Only the wait/continue debug primitives are thread-affine and
    /// those never pass through this type.
    pub struct ProcessController {
        process_handle: Option<HANDLE>,
        process_id: Option<u32>,
        thread_handles: HashMap<u32, HANDLE>,
    }

    // Kernel handles are not thread-bound, see the type-level contract above.
    unsafe impl Send for ProcessController {}

    impl Default for ProcessController {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ProcessController {
        pub fn new() -> Self {
            Self {
                process_handle: None,
                process_id: None,
                thread_handles: HashMap::new(),
            }
        }

        /// Bind the process handle received from the create-process debug event.
        pub fn bind_process(&mut self, handle: HANDLE, process_id: u32) {
            self.process_handle = Some(handle);
            self.process_id = Some(process_id);
        }

        pub fn add_thread(&mut self, thread_id: u32, handle: HANDLE) {
            self.thread_handles.insert(thread_id, handle);
        }

        pub fn remove_thread(&mut self, thread_id: u32) {
            if let Some(handle) = self.thread_handles.remove(&thread_id) {
                sys::close_handle(handle);
            }
        }

        pub fn process_id(&self) -> Option<u32> {
            self.process_id
        }

        pub fn process_handle(&self) -> Result<HANDLE, Error> {
            self.process_handle.ok_or(Error::ProcessNotStarted)
        }

        fn thread_handle(&mut self, thread_id: u32) -> Result<HANDLE, Error> {
            if let Some(handle) = self.thread_handles.get(&thread_id) {
                return Ok(*handle);
            }
            let handle = sys::open_thread(thread_id)?;
            self.thread_handles.insert(thread_id, handle);
            Ok(handle)
        }

        fn thread_handle_ref(&self, thread_id: u32) -> Result<HANDLE, Error> {
            self.thread_handles
                .get(&thread_id)
                .copied()
                .ok_or(Error::ThreadNotFound(thread_id))
        }

        pub fn terminate(&self) -> Result<(), Error> {
            sys::terminate_process(self.process_handle()?)
        }

        /// Close all owned handles. Must be called only after the event-loop
        /// worker has exited, otherwise the OS may close a handle in use.
        pub fn release(&mut self) {
            for (_, handle) in self.thread_handles.drain() {
                sys::close_handle(handle);
            }
            if let Some(handle) = self.process_handle.take() {
                sys::close_handle(handle);
            }
            self.process_id = None;
        }
    }

    impl ProcessAccess for ProcessController {
        fn read_memory(&self, addr: RelocatedAddress, size: usize) -> Result<Vec<u8>, Error> {
            sys::read_process_memory(self.process_handle()?, addr, size)
        }

        fn write_memory(&mut self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
            let handle = self.process_handle()?;
            match sys::write_process_memory(handle, addr, data) {
                Ok(()) => Ok(()),
                Err(_) => {
                    // Code sections are mapped read-execute. Grant write-execute
                    // for the duration of the write, then restore the previous
                    // protection and flush the instruction cache.
                    let old = sys::virtual_protect_ex(
                        handle,
                        addr,
                        data.len(),
                        sys::PAGE_EXECUTE_READWRITE,
                    )?;
                    let write_res = sys::write_process_memory(handle, addr, data);
                    let restore_res = sys::virtual_protect_ex(handle, addr, data.len(), old);
                    write_res?;
                    restore_res?;
                    sys::flush_instruction_cache(handle, addr, data.len());
                    Ok(())
                }
            }
        }

        fn register(&self, thread_id: u32, register: Register) -> Result<u32, Error> {
            let handle = self.thread_handle_ref(thread_id)?;
            let context = sys::get_thread_context(handle)?;
            Ok(RegisterFile::from(&context).value(register))
        }

        fn set_register(
            &mut self,
            thread_id: u32,
            register: Register,
            value: u32,
        ) -> Result<(), Error> {
            let handle = self.thread_handle(thread_id)?;
            let mut context = sys::get_thread_context(handle)?;
            sys::update_context_register(&mut context, register, value);
            sys::set_thread_context(handle, &context)
        }

        fn registers(&self, thread_id: u32) -> Result<RegisterFile, Error> {
            let handle = self.thread_handle_ref(thread_id)?;
            let context = sys::get_thread_context(handle)?;
            Ok(RegisterFile::from(&context))
        }
    }
}
