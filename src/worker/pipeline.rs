//! Runtime of a worker in a publish/pull pipeline.

use super::ResultSender;
use super::handshake::{Rendezvous, rendezvous};
use crate::error::{PipeError, Result};
use crate::ipc::protocol::{self, Command, WorkerId, decode_payload};
use crate::ipc::socket;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Ports a pipeline worker receives on its command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelinePorts {
    pub receive: u16,
    pub send: u16,
    pub controller: u16,
    pub sync: u16,
    pub worker_id: WorkerId,
}

/// Whether work should go on after a directive check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Continue,
    Stop,
}

/// The work a pipeline worker does once it has its arguments.
pub trait PipelineJob {
    type Arguments: DeserializeOwned;

    /// Do the work, sending results through `worker` and calling
    /// [`PipelineWorker::check_for_controller_directive`] at safe points.
    /// Returning early after [`Directive::Stop`] ends the worker with
    /// STOPPED instead of FINISHED.
    fn do_work(&mut self, worker: &mut PipelineWorker, arguments: Self::Arguments) -> Result<()>;

    /// Release resources before a stopped worker exits.
    fn cleanup_pre_stop(&mut self) {}
}

/// Connection of a running pipeline worker to its manager.
pub struct PipelineWorker {
    results: ResultSender,
    controller: zmq::Socket,
    stop_requested: bool,
}

impl PipelineWorker {
    pub fn worker_id(&self) -> WorkerId {
        self.results.worker_id()
    }

    pub fn send_data<T: Serialize + ?Sized>(&self, data: &T) -> Result<()> {
        self.results.send_data(data)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    /// Act on pending control messages without blocking.
    ///
    /// A PAUSE blocks here until RESUME or STOP arrives.
    pub fn check_for_controller_directive(&mut self) -> Result<Directive> {
        if self.stop_requested {
            return Ok(Directive::Stop);
        }
        while let Some(frames) = socket::try_recv_multipart(&self.controller)? {
            match self.own_command(frames)? {
                Some(Command::Pause) => return self.wait_while_paused(),
                Some(Command::Stop) => return Ok(self.request_stop()),
                _ => {}
            }
        }
        Ok(Directive::Continue)
    }

    fn wait_while_paused(&mut self) -> Result<Directive> {
        tracing::debug!(worker_id = %self.worker_id(), "Paused");
        loop {
            let frames = socket::recv_multipart(&self.controller)?;
            match self.own_command(frames)? {
                Some(Command::Resume) => {
                    tracing::debug!(worker_id = %self.worker_id(), "Resumed");
                    return Ok(Directive::Continue);
                }
                Some(Command::Stop) => return Ok(self.request_stop()),
                _ => {}
            }
        }
    }

    fn request_stop(&mut self) -> Directive {
        tracing::debug!(worker_id = %self.worker_id(), "Stop requested");
        self.stop_requested = true;
        Directive::Stop
    }

    /// Parse a control message, dropping those meant for another worker.
    fn own_command(&self, frames: Vec<Vec<u8>>) -> Result<Option<Command>> {
        let (topic, command) = protocol::parse_control(frames)?;
        Ok((topic == self.worker_id().to_filter()).then_some(command))
    }
}

/// Run one pipeline worker to completion.
///
/// Sends FINISHED after a normal finish, or STOPPED when stopped. If the
/// handshake, the arguments or the job fail, STOPPED is still sent so the
/// manager does not wait on the worker.
pub fn run_pipeline_worker<J: PipelineJob>(ports: PipelinePorts, job: &mut J) -> Result<()> {
    let context = zmq::Context::new();
    let filter = ports.worker_id.to_filter();

    let receiver = socket::connect_socket(&context, zmq::SUB, ports.receive)?;
    receiver.set_subscribe(&filter)?;
    let controller = socket::connect_socket(&context, zmq::SUB, ports.controller)?;
    controller.set_subscribe(&filter)?;
    let sync = socket::connect_socket(&context, zmq::REQ, ports.sync)?;
    let results = ResultSender::connect(&context, ports.send, ports.worker_id)?;

    let payload = match rendezvous(ports.worker_id, &receiver, &sync) {
        Ok(Rendezvous::Work(payload)) => payload,
        Ok(Rendezvous::Stop) => {
            job.cleanup_pre_stop();
            return results.send_command(Command::Stopped);
        }
        Err(e) => return abandon(job, &results, e),
    };
    let arguments: J::Arguments = match decode_payload(&payload) {
        Ok(arguments) => arguments,
        Err(e) => return abandon(job, &results, e),
    };

    let mut worker = PipelineWorker {
        results,
        controller,
        stop_requested: false,
    };
    let outcome = job.do_work(&mut worker, arguments);

    if let Err(e) = &outcome {
        tracing::error!(worker_id = %ports.worker_id, error = %e, "Work failed");
    }
    if worker.stop_requested || outcome.is_err() {
        job.cleanup_pre_stop();
        worker.results.send_command(Command::Stopped)?;
    } else {
        worker.results.send_command(Command::Finished)?;
    }
    outcome
}

/// Sign off with STOPPED after failing before the work began.
fn abandon<J: PipelineJob>(job: &mut J, results: &ResultSender, error: PipeError) -> Result<()> {
    tracing::error!(worker_id = %results.worker_id(), error = %error, "Worker could not start");
    job.cleanup_pre_stop();
    results.send_command(Command::Stopped)?;
    Err(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::Content;
    use std::time::Duration;

    fn worker_with_controller() -> (PipelineWorker, zmq::Socket, zmq::Context) {
        let context = zmq::Context::new();
        let (publisher, port) = socket::bind_socket(&context, zmq::PUB).unwrap();
        let (_sink, sink_port) = socket::bind_socket(&context, zmq::PULL).unwrap();
        let controller = socket::connect_socket(&context, zmq::SUB, port).unwrap();
        controller.set_subscribe(b"1").unwrap();
        let worker = PipelineWorker {
            results: ResultSender::connect(&context, sink_port, WorkerId::new(1)).unwrap(),
            controller,
            stop_requested: false,
        };
        // Let the subscription reach the publisher.
        std::thread::sleep(Duration::from_millis(100));
        (worker, publisher, context)
    }

    #[derive(Default)]
    struct LengthJob {
        cleaned_up: bool,
    }

    impl PipelineJob for LengthJob {
        type Arguments = Vec<u32>;

        fn do_work(&mut self, worker: &mut PipelineWorker, arguments: Vec<u32>) -> Result<()> {
            worker.send_data(&arguments.len())
        }

        fn cleanup_pre_stop(&mut self) {
            self.cleaned_up = true;
        }
    }

    #[test]
    fn test_undecodable_arguments_still_send_stopped() {
        let context = zmq::Context::new();
        let (work, receive) = socket::bind_socket(&context, zmq::PUB).unwrap();
        let (_control, controller) = socket::bind_socket(&context, zmq::PUB).unwrap();
        let (sync, sync_port) = socket::bind_socket(&context, zmq::REP).unwrap();
        let (sink, send) = socket::bind_socket(&context, zmq::PULL).unwrap();
        let ports = PipelinePorts {
            receive,
            send,
            controller,
            sync: sync_port,
            worker_id: WorkerId::new(1),
        };
        let worker = std::thread::spawn(move || {
            let mut job = LengthJob::default();
            let result = run_pipeline_worker(ports, &mut job);
            (result, job.cleaned_up)
        });

        loop {
            work.send_multipart(
                protocol::addressed(WorkerId::new(1), Content::Command(Command::Start)),
                0,
            )
            .unwrap();
            if sync.poll(zmq::POLLIN, 10).unwrap() > 0 {
                break;
            }
        }
        socket::recv_bytes(&sync).unwrap();
        sync.send(&b""[..], 0).unwrap();
        work.send_multipart(
            protocol::addressed(WorkerId::new(1), Content::Data(b"not json".to_vec())),
            0,
        )
        .unwrap();

        assert!(sink.poll(zmq::POLLIN, 5000).unwrap() > 0);
        let envelope = protocol::parse_addressed(socket::recv_multipart(&sink).unwrap()).unwrap();
        assert_eq!(envelope.worker_id, WorkerId::new(1));
        assert_eq!(envelope.content, Content::Command(Command::Stopped));

        let (result, cleaned_up) = worker.join().unwrap();
        assert!(result.is_err());
        assert!(cleaned_up);
    }

    fn wait_for_delivery() {
        std::thread::sleep(Duration::from_millis(50));
    }

    #[test]
    fn test_no_directive_continues() {
        let (mut worker, _publisher, _context) = worker_with_controller();
        assert_eq!(
            worker.check_for_controller_directive().unwrap(),
            Directive::Continue
        );
    }

    #[test]
    fn test_stop_directive() {
        let (mut worker, publisher, _context) = worker_with_controller();
        publisher
            .send_multipart(protocol::control(WorkerId::new(1), Command::Stop), 0)
            .unwrap();
        wait_for_delivery();
        assert_eq!(
            worker.check_for_controller_directive().unwrap(),
            Directive::Stop
        );
        assert!(worker.stop_requested());
        // A stop is sticky.
        assert_eq!(
            worker.check_for_controller_directive().unwrap(),
            Directive::Stop
        );
    }

    #[test]
    fn test_directive_for_other_worker_ignored() {
        let (mut worker, publisher, _context) = worker_with_controller();
        publisher
            .send_multipart(protocol::control(WorkerId::new(12), Command::Stop), 0)
            .unwrap();
        wait_for_delivery();
        assert_eq!(
            worker.check_for_controller_directive().unwrap(),
            Directive::Continue
        );
    }

    #[test]
    fn test_pause_blocks_until_resume() {
        let (mut worker, publisher, _context) = worker_with_controller();
        publisher
            .send_multipart(protocol::control(WorkerId::new(1), Command::Pause), 0)
            .unwrap();
        wait_for_delivery();

        let resumer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            publisher
                .send_multipart(protocol::control(WorkerId::new(1), Command::Resume), 0)
                .unwrap();
            publisher
        });

        let start = std::time::Instant::now();
        assert_eq!(
            worker.check_for_controller_directive().unwrap(),
            Directive::Continue
        );
        assert!(start.elapsed() >= Duration::from_millis(100));
        drop(resumer.join().unwrap());
    }
}
