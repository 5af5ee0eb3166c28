mod json_store {
    use std::path::PathBuf;
    use std::sync::Arc;

    use wavyte_orchestrator::{
        ChunkFailure, ChunkSpec, Codec, Collaborators, InMemoryArtifactStorage, InMemoryStitcher,
        JsonFileStore, LocalTransport, OrchestratorOpts, RenderId, RenderOrchestrator,
        RenderRequest, RenderState, RenderStatusStore, SystemClock, VideoConfig,
        make_multi_progress,
    };

    #[test]
    fn shared_file_store_drives_a_render_to_completion() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let dir = PathBuf::from("target").join("json_store_smoke");
        let _ = std::fs::remove_dir_all(&dir);
        let store = Arc::new(JsonFileStore::open(&dir).unwrap());
        let clock = Arc::new(SystemClock);
        let storage = Arc::new(InMemoryArtifactStorage::new());
        let renderer = |_: &ChunkSpec| -> Result<(), ChunkFailure> { Ok(()) };
        let transport = LocalTransport::new(Some(2), store.clone(), clock.clone(), Arc::new(renderer))
            .unwrap()
            .with_storage(storage.clone());

        let opts = OrchestratorOpts::from_json_str(
            r#"{"framesPerChunk": 15, "pollIntervalMs": 5, "maxWaitMs": 30000}"#,
        )
        .unwrap();
        let orchestrator = RenderOrchestrator::new(
            opts,
            Collaborators {
                store: store.clone(),
                transport: Arc::new(transport),
                stitcher: Arc::new(InMemoryStitcher::default()),
                storage,
                clock,
            },
        )
        .unwrap();

        let id = RenderId::new("json-smoke").unwrap();
        let mut handle = orchestrator
            .start(RenderRequest {
                video_config: VideoConfig {
                    duration_in_frames: 60,
                    fps: 30,
                    width: 640,
                    height: 360,
                },
                codec: Codec::Vp8,
                out_name: Some("clip.webm".to_string()),
                render_id: Some(id.clone()),
            })
            .unwrap();
        let snap = handle.wait().unwrap();
        assert_eq!(snap.state, RenderState::DownloadReady);

        // Another process sees the same record through the file alone.
        let reopened = JsonFileStore::open(&dir).unwrap();
        let record = reopened.read(&id).unwrap();
        assert_eq!(make_multi_progress(&record), snap);
        assert_eq!(record.total_chunks(), Some(4));
        assert_eq!(
            record.encoding_status().unwrap().output.as_ref().unwrap().key,
            "renders/json-smoke/clip.webm"
        );

        let raw = std::fs::read_to_string(dir.join("json-smoke.json")).unwrap();
        assert!(raw.contains("\"chunksRendered\""));
        assert!(raw.contains("\"timeToFinishChunks\""));

        handle.confirm_download().unwrap();
        handle.archive().unwrap();
        assert!(!dir.join("json-smoke.json").exists());
    }
}
