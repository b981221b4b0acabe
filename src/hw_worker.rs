use crate::error::Result;
use crate::hw::card::PcmStream;
use crate::hw::driver::{AudioDriver, DriverControls};
#[cfg(unix)]
use nix::libc;
use std::thread::JoinHandle;
use tracing::error;

#[cfg(unix)]
const RT_POLICY: i32 = libc::SCHED_FIFO;
const RT_PRIORITY_WORKER: i32 = 18;
const WORKER_THREAD_NAME: &str = "alsa-io-worker";

fn configure_rt_thread(name: &str, priority: i32) -> std::result::Result<(), String> {
    #[cfg(unix)]
    {
        let thread = unsafe { libc::pthread_self() };
        #[cfg(target_os = "linux")]
        {
            let c_name = std::ffi::CString::new(name).map_err(|e| e.to_string())?;
            unsafe {
                let _ = libc::pthread_setname_np(thread, c_name.as_ptr());
            }
        }

        let param = unsafe {
            let mut p = std::mem::zeroed::<libc::sched_param>();
            p.sched_priority = priority;
            p
        };
        let rc = unsafe { libc::pthread_setschedparam(thread, RT_POLICY, &param) };
        if rc != 0 {
            return Err(format!(
                "pthread_setschedparam({}, prio {}) failed with errno {}",
                name, priority, rc
            ));
        }

        let mut actual_policy = 0_i32;
        let mut actual_param = unsafe { std::mem::zeroed::<libc::sched_param>() };
        let rc =
            unsafe { libc::pthread_getschedparam(thread, &mut actual_policy, &mut actual_param) };
        if rc != 0 {
            return Err(format!(
                "pthread_getschedparam({}) failed with errno {}",
                name, rc
            ));
        }
        if actual_policy != RT_POLICY || actual_param.sched_priority != priority {
            return Err(format!(
                "realtime verification failed for {}: policy {}, prio {}",
                name, actual_policy, actual_param.sched_priority
            ));
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = name;
        let _ = priority;
        Err("Realtime thread priority is not supported on this platform".to_string())
    }
}

fn lock_memory_pages() -> std::result::Result<(), String> {
    #[cfg(unix)]
    {
        let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
        if rc == 0 {
            Ok(())
        } else {
            Err(format!(
                "mlockall(MCL_CURRENT|MCL_FUTURE) failed: {}",
                std::io::Error::last_os_error()
            ))
        }
    }
    #[cfg(not(unix))]
    {
        Err("mlockall is not supported on this platform".to_string())
    }
}

/// The real-time audio thread: owns the driver for its lifetime and runs the
/// wait cycle until asked to stop or a cycle fails fatally.
pub struct AudioWorker<S: PcmStream + Send + 'static> {
    controls: DriverControls,
    handle: JoinHandle<(AudioDriver<S>, Result<()>)>,
}

pub fn spawn<S: PcmStream + Send + 'static>(
    driver: AudioDriver<S>,
) -> std::io::Result<AudioWorker<S>> {
    let controls = driver.controls();
    let handle = std::thread::Builder::new()
        .name(WORKER_THREAD_NAME.to_string())
        .spawn(move || work(driver))?;
    Ok(AudioWorker { controls, handle })
}

fn work<S: PcmStream + Send + 'static>(mut driver: AudioDriver<S>) -> (AudioDriver<S>, Result<()>) {
    if let Err(e) = lock_memory_pages() {
        error!("{WORKER_THREAD_NAME} memory lock not enabled: {e}");
    }
    if let Err(e) = configure_rt_thread(WORKER_THREAD_NAME, RT_PRIORITY_WORKER) {
        error!("{WORKER_THREAD_NAME} realtime priority not enabled: {e}");
    }

    if let Err(e) = driver.start() {
        error!("audio start failed: {e}");
        return (driver, Err(e));
    }

    let controls = driver.controls();
    let mut result = Ok(());
    while !controls.stop_requested() {
        if let Err(e) = driver.wait_cycle() {
            error!("audio cycle failed: {e}");
            result = Err(e);
            break;
        }
    }

    let stopped = driver.stop();
    (driver, result.and(stopped))
}

impl<S: PcmStream + Send + 'static> AudioWorker<S> {
    pub fn controls(&self) -> DriverControls {
        self.controls.clone()
    }

    /// Request a stop and join, handing the driver back along with the
    /// terminal cycle result.
    pub fn stop(self) -> std::thread::Result<(AudioDriver<S>, Result<()>)> {
        self.controls.request_stop();
        self.handle.join()
    }
}
