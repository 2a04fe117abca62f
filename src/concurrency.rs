use std::thread;

pub type Sender<T> = crossbeam_channel::Sender<T>;
pub type Receiver<T> = crossbeam_channel::Receiver<T>;

/// Runs `work` on each job in parallel and feeds the results to `consume`
/// in job order.
///
/// Each job runs on its own scoped OS thread. A separate thread receives
/// the results and hands them to the consumer one at a time, in the order
/// the jobs were given, whatever order they finish in.
///
/// At any time the number of running jobs plus the number of results
/// waiting to be consumed is at most `max_inflight` (at least one).
pub fn ordered_parallel<I, W, R, C>(jobs: I, work: W, mut consume: C, max_inflight: usize)
where
    I: IntoIterator,
    I::Item: Send,
    W: Fn(I::Item) -> R + Sync,
    R: Send,
    C: FnMut(R) + Send,
{
    let max_inflight = max_inflight.max(1);
    let mut jobs = jobs.into_iter();
    let work = &work;
    let consume = &mut consume;

    // Ordering: result channels are queued in the order jobs are spawned and
    // the queue is FIFO. The consumer acknowledges each result so the main
    // loop knows it may start another job.
    thread::scope(|ts| {
        let (queue_s, queue_r) = crossbeam_channel::unbounded::<Receiver<R>>();
        let (ack_s, ack_r) = crossbeam_channel::unbounded::<()>();

        ts.spawn(move || {
            for result in queue_r {
                // A job that panicked drops its sender without sending.
                if let Ok(r) = result.recv() {
                    consume(r);
                }
                if ack_s.send(()).is_err() {
                    break;
                }
            }
        });

        let mut remain = true;
        let mut inflight = 0usize;
        while remain || inflight > 0 {
            while remain && inflight < max_inflight {
                match jobs.next() {
                    None => remain = false,
                    Some(job) => {
                        let (s, r): (Sender<R>, Receiver<R>) = crossbeam_channel::bounded(1);
                        ts.spawn(move || {
                            let _ = s.send(work(job));
                        });
                        if queue_s.send(r).is_err() {
                            remain = false;
                        }
                        inflight += 1;
                    }
                }
            }
            if inflight > 0 {
                if ack_r.recv().is_err() {
                    break;
                }
                inflight -= 1;
            }
        }
        drop(queue_s);
    });
}
