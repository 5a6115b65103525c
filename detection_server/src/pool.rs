use crate::detector::{CancelFlag, DetectionError, Detector};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, Mutex};

struct Job {
    image: Vec<u8>,
    reply: oneshot::Sender<Result<Vec<u8>, DetectionError>>,
}

/// Fixed set of workers fed through a bounded queue.
///
/// Connection handlers never call the detector directly; they enqueue a job
/// and wait for the reply, so at most `workers` detections run at once no
/// matter how many clients are connected.
///
/// A worker stops waiting on a job as soon as its requester goes away and
/// cancels it. A detector that ignores the cancel flag keeps its blocking
/// thread until it returns, but no longer holds up the queue.
#[derive(Clone)]
pub struct DetectionPool {
    queue: mpsc::Sender<Job>,
}

impl DetectionPool {
    /// Must be called from within a tokio runtime.
    pub fn new(detector: impl Detector, workers: usize, queue_capacity: usize) -> Self {
        let workers = workers.max(1);
        let (queue, jobs) = mpsc::channel(queue_capacity.max(1));
        let jobs = Arc::new(Mutex::new(jobs));
        let detector = Arc::new(detector);

        for worker_id in 0..workers {
            tokio::spawn(run_worker(worker_id, detector.clone(), jobs.clone()));
        }

        tracing::info!("Started {} detection workers", workers);

        Self { queue }
    }

    pub async fn detect(&self, image: Vec<u8>) -> Result<Vec<u8>, DetectionError> {
        let (reply, response) = oneshot::channel();
        self.queue
            .send(Job { image, reply })
            .await
            .map_err(|_| DetectionError::Unavailable)?;

        response.await.map_err(|_| DetectionError::Unavailable)?
    }
}

async fn run_worker<D: Detector>(
    worker_id: usize,
    detector: Arc<D>,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
) {
    loop {
        let job = jobs.lock().await.recv().await;
        let Some(Job { image, mut reply }) = job else {
            break;
        };

        // The exchange timed out or its client went away while queued.
        if reply.is_closed() {
            tracing::debug!("Worker {} skipping abandoned job", worker_id);
            continue;
        }

        let started = Instant::now();
        let image_len = image.len();
        let cancel = CancelFlag::default();
        // Also fires if this worker is dropped with the runtime.
        let _cancel_on_drop = CancelGuard(cancel.clone());

        let mut task = tokio::task::spawn_blocking({
            let detector = detector.clone();
            let cancel = cancel.clone();
            move || detector.detect_cancellable(&image, &cancel)
        });

        let result = tokio::select! {
            joined = &mut task => joined.unwrap_or_else(|e| {
                Err(DetectionError::Model(format!("detector panicked: {}", e)))
            }),
            _ = reply.closed() => {
                cancel.cancel();
                tracing::warn!(
                    "Worker {} cancelled detection after {} ms, requester went away",
                    worker_id,
                    started.elapsed().as_millis()
                );
                continue;
            }
        };

        tracing::debug!(
            "Worker {} handled {} bytes in {} ms",
            worker_id,
            image_len,
            started.elapsed().as_millis()
        );

        let _ = reply.send(result);
    }

    tracing::debug!("Detection worker {} stopped", worker_id);
}

struct CancelGuard(CancelFlag);

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::from_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_detect_returns_detector_output() {
        let pool = DetectionPool::new(
            from_fn(|image| {
                let mut output = image.to_vec();
                output.push(b'!');
                Ok(output)
            }),
            1,
            4,
        );

        let output = pool.detect(b"image".to_vec()).await.unwrap();

        assert_eq!(output, b"image!");
    }

    #[tokio::test]
    async fn test_detect_propagates_detector_error() {
        let pool = DetectionPool::new(
            from_fn(|_| Err(DetectionError::Model("out of memory".to_string()))),
            1,
            4,
        );

        let result = pool.detect(vec![1, 2, 3]).await;

        assert!(matches!(result, Err(DetectionError::Model(msg)) if msg == "out of memory"));
    }

    #[tokio::test]
    async fn test_panicking_detector_does_not_kill_worker() {
        let pool = DetectionPool::new(
            from_fn(|image| {
                if image.is_empty() {
                    panic!("empty image");
                }
                Ok(image.to_vec())
            }),
            1,
            4,
        );

        assert!(matches!(
            pool.detect(Vec::new()).await,
            Err(DetectionError::Model(_))
        ));
        assert_eq!(pool.detect(vec![7]).await.unwrap(), vec![7]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_detections_bounded_by_workers() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let detector = {
            let running = running.clone();
            let peak = peak.clone();
            from_fn(move |image| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(30));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(image.to_vec())
            })
        };
        let pool = DetectionPool::new(detector, 2, 2);

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.detect(vec![i]).await })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), vec![i as u8]);
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abandoned_detection_frees_worker() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let detector = {
            let cancelled = cancelled.clone();
            SlowDetector { cancelled }
        };
        let pool = DetectionPool::new(detector, 1, 4);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(300), pool.detect(b"hang".to_vec())).await;
        assert!(abandoned.is_err());

        let started = Instant::now();
        let output = tokio::time::timeout(Duration::from_secs(2), pool.detect(b"ok".to_vec()))
            .await
            .expect("worker still busy with the abandoned job")
            .unwrap();

        assert_eq!(output, b"ok");
        assert!(started.elapsed() < Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    /// Spins on `b"hang"` until cancelled, echoes anything else.
    struct SlowDetector {
        cancelled: Arc<AtomicUsize>,
    }

    impl Detector for SlowDetector {
        fn detect(&self, image: &[u8]) -> Result<Vec<u8>, DetectionError> {
            self.detect_cancellable(image, &CancelFlag::default())
        }

        fn detect_cancellable(
            &self,
            image: &[u8],
            cancel: &CancelFlag,
        ) -> Result<Vec<u8>, DetectionError> {
            if image != b"hang" {
                return Ok(image.to_vec());
            }
            let started = Instant::now();
            while started.elapsed() < Duration::from_secs(3) {
                if cancel.is_cancelled() {
                    self.cancelled.fetch_add(1, Ordering::SeqCst);
                    return Err(DetectionError::Cancelled);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(image.to_vec())
        }
    }
}
