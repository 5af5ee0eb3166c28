mod render_scenarios {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use wavyte_orchestrator::{
        ChunkFailure, ChunkIndex, ChunkSpec, Codec, Collaborators, EnhancedErrorInfo, ErrorSource,
        InMemoryArtifactStorage, InMemoryStatusStore, InMemoryStitcher, LocalTransport,
        ManualClock, MultiRenderProgress, OrchestratorError, OrchestratorOpts, OrchestratorResult,
        OutputArtifact, ProgressUpdate, RenderHandle, RenderId, RenderMetadata,
        RenderOrchestrator, RenderProgress, RenderRequest, RenderState, RenderStatusStore,
        StitchJob, Stitcher, VideoConfig, chunk_artifact_key, format_errors, make_multi_progress,
    };

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn opts(frames_per_chunk: u64) -> OrchestratorOpts {
        OrchestratorOpts {
            frames_per_chunk,
            poll_interval_ms: 2,
            max_wait_ms: 30_000,
            worker_threads: Some(4),
            ..OrchestratorOpts::default()
        }
    }

    fn request(id: &str, frames: u64, out_name: Option<&str>) -> RenderRequest {
        RenderRequest {
            video_config: VideoConfig {
                duration_in_frames: frames,
                fps: 30,
                width: 1280,
                height: 720,
            },
            codec: Codec::H264,
            out_name: out_name.map(str::to_string),
            render_id: Some(RenderId::new(id).unwrap()),
        }
    }

    /// Stitcher that checks every chunk is rendered before it runs.
    struct CheckingStitcher {
        store: Arc<dyn RenderStatusStore>,
        inner: InMemoryStitcher,
        calls: AtomicU32,
    }

    impl Stitcher for CheckingStitcher {
        fn stitch(
            &self,
            job: &StitchJob,
            on_frames: &mut dyn FnMut(u64) -> OrchestratorResult<()>,
        ) -> OrchestratorResult<OutputArtifact> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let progress = self.store.read(&job.render_id)?;
            assert_eq!(progress.chunks(), job.total_chunks);
            self.inner.stitch(job, on_frames)
        }
    }

    struct Harness {
        store: Arc<InMemoryStatusStore>,
        storage: Arc<InMemoryArtifactStorage>,
        stitcher: Arc<CheckingStitcher>,
        orchestrator: RenderOrchestrator,
    }

    fn harness<R>(opts: OrchestratorOpts, storage: InMemoryArtifactStorage, renderer: R) -> Harness
    where
        R: Fn(&ChunkSpec) -> Result<(), ChunkFailure> + Send + Sync + 'static,
    {
        let store = Arc::new(InMemoryStatusStore::new());
        let storage = Arc::new(storage);
        let clock = Arc::new(ManualClock::new(1_000));
        let transport = LocalTransport::new(
            opts.worker_threads,
            store.clone(),
            clock.clone(),
            Arc::new(renderer),
        )
        .unwrap()
        .with_storage(storage.clone());
        let stitcher = Arc::new(CheckingStitcher {
            store: store.clone(),
            inner: InMemoryStitcher::new(50),
            calls: AtomicU32::new(0),
        });
        let orchestrator = RenderOrchestrator::new(
            opts,
            Collaborators {
                store: store.clone(),
                transport: Arc::new(transport),
                stitcher: stitcher.clone(),
                storage: storage.clone(),
                clock,
            },
        )
        .unwrap();
        Harness {
            store,
            storage,
            stitcher,
            orchestrator,
        }
    }

    /// Poll to a terminal state, checking stage visibility on every snapshot.
    fn drive(handle: &mut RenderHandle) -> Vec<MultiRenderProgress> {
        let mut seen = Vec::new();
        for _ in 0..10_000 {
            let snap = handle.poll().unwrap();
            assert_visibility(&snap);
            let done = snap.state.is_terminal();
            seen.push(snap);
            if done {
                return seen;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        panic!("render did not reach a terminal state");
    }

    fn assert_visibility(snap: &MultiRenderProgress) {
        if let Some(chunks) = &snap.chunk_progress
            && chunks.completed > 0
        {
            let invoke = snap.lambda_invoke_progress.as_ref().unwrap();
            assert!(invoke.progress.completed > 0);
        }
        if snap.encoding_progress.is_some() {
            assert!(snap.chunk_progress.as_ref().unwrap().is_done());
        }
        if snap.cleanup_info.is_some() {
            assert!(snap.encoding_progress.as_ref().unwrap().progress.is_done());
        }
        if snap.download_progress.is_some() {
            assert!(snap.encoding_progress.as_ref().unwrap().progress.is_done());
        }
    }

    #[test]
    fn flaky_chunk_is_retried_until_it_renders() {
        init_tracing();
        let h = harness(
            opts(30),
            InMemoryArtifactStorage::new(),
            |spec: &ChunkSpec| {
                if spec.chunk == ChunkIndex(6) && spec.attempt <= 2 {
                    Err(ChunkFailure::retryable("ECONNRESET").with_stack("socket hang up"))
                } else {
                    Ok(())
                }
            },
        );
        let mut handle = h
            .orchestrator
            .start(request("flaky", 300, Some("final.mp4")))
            .unwrap();
        let snaps = drive(&mut handle);
        let last = snaps.last().unwrap();
        assert_eq!(last.state, RenderState::DownloadReady);

        let chunks = last.chunk_progress.as_ref().unwrap();
        assert_eq!((chunks.completed, chunks.total), (10, Some(10)));
        assert!(chunks.is_done());

        let attempts: Vec<u32> = last
            .retries
            .iter()
            .filter(|r| r.chunk == ChunkIndex(6))
            .map(|r| r.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2]);
        assert_eq!(last.retries.len(), 2);
        assert_eq!(last.lambda_invoke_progress.as_ref().unwrap().retries, 2);

        let lines = format_errors(&last.errors);
        assert_eq!(lines.len(), 2);
        assert!(
            lines
                .iter()
                .all(|l| l.starts_with("Error in chunk 6 (will retry): socket hang up"))
        );

        assert_eq!(h.stitcher.calls.load(Ordering::SeqCst), 1);
        assert!(h.storage.is_empty());
        assert_eq!(last.cleanup_info.as_ref().unwrap().progress.total, Some(10));

        let download = last.download_progress.as_ref().unwrap();
        assert_eq!(download.out_name, "final.mp4");
        assert!(!download.downloaded);

        handle.confirm_download().unwrap();
        assert_eq!(handle.poll().unwrap().state, RenderState::Downloaded);
        let archived = handle.archive().unwrap();
        assert!(archived.is_downloaded());
        assert!(h.store.read(&RenderId::new("flaky").unwrap()).is_err());
    }

    #[test]
    fn exhausted_retry_budget_fails_the_render() {
        init_tracing();
        let h = harness(
            opts(20),
            InMemoryArtifactStorage::new(),
            |spec: &ChunkSpec| {
                if spec.chunk == ChunkIndex(2) {
                    Err(ChunkFailure::retryable("lambda timed out"))
                } else {
                    Ok(())
                }
            },
        );
        let mut handle = h.orchestrator.start(request("doomed", 100, None)).unwrap();
        let detail = match handle.wait() {
            Err(OrchestratorError::RenderFailed(detail)) => detail,
            Err(other) => panic!("expected a render failure, got {other:?}"),
            Ok(snap) => panic!("render unexpectedly finished as {}", snap.state),
        };
        assert!(detail.contains("Error in chunk 2"));
        assert!(!detail.contains("(will retry)"));

        let p = h.store.read(&RenderId::new("doomed").unwrap()).unwrap();
        assert_eq!(p.total_chunks(), Some(5));
        assert_eq!(RenderState::from_progress(&p), RenderState::Failed);
        let attempts: Vec<u32> = p
            .retries()
            .for_chunk(ChunkIndex(2))
            .map(|r| r.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert!(p.encoding_status().is_none());
        assert!(p.cleanup().is_none());
        assert_eq!(h.stitcher.calls.load(Ordering::SeqCst), 0);

        let snap = make_multi_progress(&p);
        assert!(snap.encoding_progress.is_none());
        assert!(snap.cleanup_info.is_none());
    }

    #[test]
    fn clean_renders_record_no_retries() {
        init_tracing();
        for chunks in [1u64, 2, 7, 16] {
            let h = harness(opts(10), InMemoryArtifactStorage::new(), |_: &ChunkSpec| {
                Ok(())
            });
            let id = format!("clean-{chunks}");
            let mut handle = h
                .orchestrator
                .start(request(&id, chunks * 10 - 3, None))
                .unwrap();
            let last = drive(&mut handle).pop().unwrap();
            assert_eq!(last.state, RenderState::DownloadReady);
            assert!(last.retries.is_empty());
            assert!(last.errors.is_empty());

            let chunk_done_in = last.chunk_progress.as_ref().unwrap().done_in;
            assert!(chunk_done_in.is_some());
            let again = handle.poll().unwrap();
            assert_eq!(again.chunk_progress.unwrap().done_in, chunk_done_in);
            assert_eq!(last.overall_progress(), 1.0);
        }
    }

    #[test]
    fn zero_chunk_record_finishes_chunk_stage_immediately() {
        let mut p = RenderProgress::new(RenderId::new("zero").unwrap(), 10);
        let metadata = RenderMetadata {
            total_chunks: 0,
            estimated_render_lambda_invocations: 0,
            frames_per_chunk: 20,
            video_config: VideoConfig {
                duration_in_frames: 0,
                fps: 30,
                width: 8,
                height: 8,
            },
            codec: Codec::H264,
            out_name: None,
            start_ms: 10,
        };
        assert!(p.apply(&ProgressUpdate::MetadataSet { metadata }, 25).unwrap());
        assert_eq!(p.time_to_finish_chunks(), Some(0));
        assert!(p.retries().is_empty());
        assert_eq!(RenderState::from_progress(&p), RenderState::Encoding);
    }

    #[test]
    fn concurrent_retries_stay_contiguous() {
        init_tracing();
        let h = harness(
            OrchestratorOpts {
                worker_threads: Some(8),
                ..opts(5)
            },
            InMemoryArtifactStorage::new(),
            |spec: &ChunkSpec| {
                // Every third chunk needs three attempts, every other one needs two.
                let needed = match spec.chunk.0 % 3 {
                    0 => 3,
                    1 => 2,
                    _ => 1,
                };
                if spec.attempt < needed {
                    Err(ChunkFailure::retryable("throttled"))
                } else {
                    Ok(())
                }
            },
        );
        let mut handle = h.orchestrator.start(request("contig", 200, None)).unwrap();
        let last = handle.wait().unwrap();
        assert_eq!(last.chunk_progress.as_ref().unwrap().completed, 40);

        let p = h.store.read(handle.render_id()).unwrap();
        for c in 0..40 {
            let attempts: Vec<u32> = p
                .retries()
                .for_chunk(ChunkIndex(c))
                .map(|r| r.attempt)
                .collect();
            let expected: Vec<u32> = match c % 3 {
                0 => vec![1, 2],
                1 => vec![1],
                _ => vec![],
            };
            assert_eq!(attempts, expected, "chunk {c}");
        }
    }

    #[test]
    fn polling_without_writes_is_byte_identical() {
        let h = harness(opts(25), InMemoryArtifactStorage::new(), |_: &ChunkSpec| {
            Ok(())
        });
        let mut handle = h.orchestrator.start(request("idem", 100, None)).unwrap();
        drive(&mut handle);

        let a = serde_json::to_vec(&handle.poll().unwrap()).unwrap();
        let b = serde_json::to_vec(&handle.poll().unwrap()).unwrap();
        let c = serde_json::to_vec(&handle.snapshot().unwrap()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn failed_artifact_deletion_does_not_block_readiness() {
        init_tracing();
        let id = RenderId::new("sticky").unwrap();
        let stuck = chunk_artifact_key(&id, ChunkIndex(1));
        let h = harness(
            opts(10),
            InMemoryArtifactStorage::with_undeletable([stuck.clone()]),
            |_: &ChunkSpec| Ok(()),
        );
        let mut handle = h.orchestrator.start(request("sticky", 30, None)).unwrap();
        let last = handle.wait().unwrap();
        assert_eq!(last.state, RenderState::DownloadReady);

        let cleanup = last.cleanup_info.as_ref().unwrap();
        assert!(cleanup.progress.is_done());
        assert_eq!(cleanup.progress.completed, 2);
        assert_eq!(cleanup.progress.total, Some(3));
        assert_eq!(cleanup.min_files_to_delete, 2);
        assert!(cleanup.progress.ratio() <= 1.0);

        assert!(h.storage.contains(&stuck));
        assert!(!last.errors.is_empty());
        assert!(last.errors.iter().all(|e| !e.is_fatal()));

        let lines = format_errors(&last.errors);
        assert_eq!(lines.len(), 2);
        for line in &lines {
            assert!(
                line.starts_with(
                    "Error while preparing render (will retry): store error: access denied deleting"
                ),
                "{line}"
            );
            assert!(!line.starts_with("Error during preparation"));
        }
    }

    #[test]
    fn finished_render_ignores_late_cancel_and_failures() {
        init_tracing();
        let h = harness(opts(10), InMemoryArtifactStorage::new(), |_: &ChunkSpec| Ok(()));
        let mut handle = h.orchestrator.start(request("settled", 30, None)).unwrap();
        let ready = handle.wait().unwrap();
        assert_eq!(ready.state, RenderState::DownloadReady);

        handle.cancel().unwrap();
        assert_eq!(handle.poll().unwrap().state, RenderState::DownloadReady);

        let id = RenderId::new("settled").unwrap();
        let late = ProgressUpdate::ErrorRecorded {
            error: EnhancedErrorInfo {
                message: "worker crashed".to_string(),
                stack: String::new(),
                chunk: Some(ChunkIndex(0)),
                attempt: 4,
                will_retry: false,
                source: ErrorSource::Renderer,
                time_ms: 5_000,
            },
        };
        assert!(!h.store.apply(&id, &late, 5_000).unwrap());

        let snap = handle.poll().unwrap();
        assert_eq!(snap.state, RenderState::DownloadReady);
        assert_eq!(snap, ready);
        assert!(handle.archive().is_ok());
    }
}
