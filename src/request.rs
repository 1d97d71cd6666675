//! Work forwarded from non-vcpu threads to whichever vcpu thread picks it up
//! first.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;

use log::{debug, trace};
use spin::Mutex;

use crate::flags::VmFlags;
use crate::hal::{VmmHal, WaitEvent};
use crate::rendezvous::wait_signaled;
use crate::vcpu::VCpu;
use crate::vm::Vm;
use crate::{StrictStatus, VmmResult};

type Job<H> = Box<dyn FnOnce(&Vm<H>, &VCpu<H>) -> VmmResult<StrictStatus> + Send>;

struct Request<H: VmmHal> {
    job: Mutex<Option<Job<H>>>,
    result: Mutex<Option<VmmResult<StrictStatus>>>,
    done: H::Event,
}

/// A FIFO of pending requests. [`VmFlags::REQUEST`] is raised whenever the
/// queue is non-empty and cleared by the pop that drains it.
pub(crate) struct RequestQueue<H: VmmHal> {
    queue: Mutex<VecDeque<Arc<Request<H>>>>,
}

impl<H: VmmHal> RequestQueue<H> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, vm: &Vm<H>, request: Arc<Request<H>>, priority: bool) {
        let mut queue = self.queue.lock();
        if priority {
            queue.push_front(request);
        } else {
            queue.push_back(request);
        }
        vm.flags().set(VmFlags::REQUEST);
    }

    fn pop(&self, vm: &Vm<H>) -> Option<Arc<Request<H>>> {
        let mut queue = self.queue.lock();
        let request = queue.pop_front();
        if queue.is_empty() {
            vm.clear_global_flags(VmFlags::REQUEST);
        }
        request
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

impl<H: VmmHal> Vm<H> {
    /// Queue `job` for execution on any vcpu thread and wait for its result.
    ///
    /// `priority` requests are served before everything already queued.
    pub(crate) fn call_on_any_vcpu<F>(&self, priority: bool, job: F) -> VmmResult<StrictStatus>
    where
        F: FnOnce(&Vm<H>, &VCpu<H>) -> VmmResult<StrictStatus> + Send + 'static,
    {
        let request = Arc::new(Request::<H> {
            job: Mutex::new(Some(Box::new(job))),
            result: Mutex::new(None),
            done: H::new_event()?,
        });
        self.requests.push(self, request.clone(), priority);
        // The first vcpu thread to notice takes the request.
        self.kick_all();
        trace!("queued request (priority: {})", priority);

        loop {
            wait_signaled(&request.done)?;
            if let Some(result) = request.result.lock().take() {
                return result;
            }
        }
    }

    /// Run every queued request on the calling vcpu thread.
    pub(crate) fn process_requests(&self, vcpu: &VCpu<H>) -> VmmResult<StrictStatus> {
        while let Some(request) = self.requests.pop(self) {
            let Some(job) = request.job.lock().take() else {
                continue;
            };
            debug!("vcpu {} serving a forwarded request", vcpu.id());
            let result = job(self, vcpu);
            *request.result.lock() = Some(result);
            request.done.signal();
        }
        Ok(StrictStatus::SUCCESS)
    }

    /// Number of requests waiting for a vcpu thread.
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }
}
