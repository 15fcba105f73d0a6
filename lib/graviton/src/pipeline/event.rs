//! Kernels that carry pipeline state changes to whoever registered as the
//! event listener (the network master). These never leave the process.

use crate::addr::Endpoint;
use crate::app::AppId;
use crate::ifaddr::IfaceAddr;
use crate::kernel::{Header, Kernel, KernelId, Link};
use crate::kernel_cast;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PipelineEvent {
    AddServer(IfaceAddr),
    RemoveServer(IfaceAddr),
    AddClient(Endpoint),
    RemoveClient(Endpoint),
}

pub struct PipelineEventKernel {
    header: Header,
    event: PipelineEvent,
}

impl PipelineEventKernel {
    pub fn new(event: PipelineEvent, listener: KernelId) -> PipelineEventKernel {
        let mut header = Header::new();
        header.set_principal(Link::Id(listener));
        PipelineEventKernel { header, event }
    }

    #[inline]
    pub fn event(&self) -> &PipelineEvent {
        &self.event
    }
}

impl Kernel for PipelineEventKernel {
    fn header(&self) -> &Header {
        &self.header
    }

    fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    kernel_cast!();
}

/// A child application's process finished (or its main kernel returned).
pub struct ProcessEventKernel {
    header: Header,
    app: AppId,
    exit_code: i32,
}

impl ProcessEventKernel {
    pub fn new(app: AppId, exit_code: i32, listener: KernelId) -> ProcessEventKernel {
        let mut header = Header::new();
        header.set_principal(Link::Id(listener));
        ProcessEventKernel {
            header,
            app,
            exit_code,
        }
    }

    #[inline]
    pub fn app(&self) -> AppId {
        self.app
    }

    #[inline]
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }
}

impl Kernel for ProcessEventKernel {
    fn header(&self) -> &Header {
        &self.header
    }

    fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    kernel_cast!();
}
