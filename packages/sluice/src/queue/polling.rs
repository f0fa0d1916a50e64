// internal future polling system for blocking on dequeue futures.
//
// design based on pollster crate, but with extensive modifications.

use std::{
    future::Future,
    sync::{Arc, Condvar, Mutex},
    task::{Context, Poll, Wake, Waker},
    time::Instant,
    pin::Pin,
};


// `Future` which can be told to give up.
//
// after abort is called, the future must resolve promptly without further outside action: either
// to the outcome it was about to produce anyway, or to the outcome of having been aborted.
pub(crate) trait Abort: Future + Unpin {
    fn abort(&mut self);
}

// timeout for blocking on a future.
pub(crate) enum Timeout {
    // never time out.
    Never,
    // time out at the given deadline.
    At(Instant),
    // time out if the future cannot be resolved without blocking.
    NonBlocking,
}

// poll the future until it resolves or the timeout is reached. on timeout, abort the future, wait
// for it to settle, and return its output as err.
pub(crate) fn poll<F: Abort>(fut: &mut F, timeout: Timeout) -> Result<F::Output, F::Output> {
    let signal = Arc::new(Signal {
        state: Mutex::new(State::Empty),
        cond: Condvar::new(),
    });
    let waker = Waker::from(Arc::clone(&signal));
    let mut cx = Context::from_waker(&waker);

    if let Some(output) = poll_inner(fut, &signal, &mut cx, &timeout) {
        return Ok(output);
    }
    fut.abort();
    Err(poll_inner(fut, &signal, &mut cx, &Timeout::Never)
        .expect("poll timed out with Timeout::Never"))
}

// poll future with context until resolves or times out.
fn poll_inner<F: Abort>(
    fut: &mut F,
    signal: &Signal,
    cx: &mut Context,
    timeout: &Timeout,
) -> Option<F::Output> {
    loop {
        // return if ready
        if let Poll::Ready(output) = Pin::new(&mut *fut).poll(cx) {
            return Some(output);
        }

        // otherwise, block until notification or timeout
        let mut lock = signal.state.lock().unwrap();

        // if a notification is already present, release the lock and try polling again without
        // blocking.
        if let State::Notified = *lock {
            *lock = State::Empty;
            continue;
        }

        debug_assert!(matches!(*lock, State::Empty));
        *lock = State::Waiting;
        match *timeout {
            // block on mutex + condvar indefinitely
            Timeout::Never =>
                while let State::Waiting = *lock {
                    lock = signal.cond.wait(lock).unwrap();
                },

            // block on mutex + condvar until deadline, at which point return none
            Timeout::At(deadline) =>
                while let State::Waiting = *lock {
                    let Some(duration) = deadline.checked_duration_since(Instant::now())
                        else {
                            *lock = State::Empty;
                            return None;
                        };
                    let (lock2, wait_result) = signal.cond.wait_timeout(lock, duration).unwrap();
                    lock = lock2;
                    if wait_result.timed_out() {
                        if let State::Waiting = *lock {
                            *lock = State::Empty;
                            return None;
                        }
                    }
                },

            // dont block on mutex + condvar, return none instead
            Timeout::NonBlocking => {
                *lock = State::Empty;
                return None;
            }
        }
        *lock = State::Empty;
    }
}

// synchronization signal state
enum State {
    Empty,
    Waiting,
    Notified,
}

// synchronization signal
struct Signal {
    state: Mutex<State>,
    cond: Condvar,
}

impl Wake for Signal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let mut lock = self.state.lock().unwrap();
        match *lock {
            State::Notified => (),
            State::Empty => {
                *lock = State::Notified;
            }
            State::Waiting => {
                *lock = State::Empty;
                self.cond.notify_one();
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        thread,
        time::Duration,
    };

    // resolves once `ready` is set, or immediately once aborted.
    struct Flag {
        ready: Arc<Mutex<(bool, Option<Waker>)>>,
        aborted: bool,
    }

    impl Future for Flag {
        type Output = &'static str;

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
            if self.aborted {
                return Poll::Ready("aborted");
            }
            let mut lock = self.ready.lock().unwrap();
            if lock.0 {
                Poll::Ready("ready")
            } else {
                lock.1 = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    impl Abort for Flag {
        fn abort(&mut self) {
            self.aborted = true;
        }
    }

    fn flag() -> (Flag, Arc<Mutex<(bool, Option<Waker>)>>) {
        let ready = Arc::new(Mutex::new((false, None)));
        (Flag { ready: Arc::clone(&ready), aborted: false }, ready)
    }

    fn set(ready: &Mutex<(bool, Option<Waker>)>) {
        let mut lock = ready.lock().unwrap();
        lock.0 = true;
        if let Some(waker) = lock.1.take() {
            waker.wake();
        }
    }

    #[test]
    fn non_blocking_aborts() {
        let (mut fut, _ready) = flag();
        assert_eq!(poll(&mut fut, Timeout::NonBlocking), Err("aborted"));
    }

    #[test]
    fn woken_from_other_thread() {
        let (mut fut, ready) = flag();
        let join = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            set(&ready);
        });
        assert_eq!(poll(&mut fut, Timeout::Never), Ok("ready"));
        join.join().unwrap();
    }

    #[test]
    fn deadline_passes() {
        let (mut fut, _ready) = flag();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(poll(&mut fut, Timeout::At(deadline)), Err("aborted"));
        assert!(Instant::now() >= deadline);
    }
}
