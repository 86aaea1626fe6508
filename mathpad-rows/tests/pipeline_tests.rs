//! End-to-end tests for the row pipeline
//!
//! Recognition, merge, cleanup and validation run against in-process service
//! doubles. Debounce timers run on paused tokio time.

mod helpers;

use helpers::*;
use mathpad_rows::models::{
    OcrStatus, Point, RowContent, RowId, RowPatch, Stroke, ValidationMethod, ValidationStatus,
};
use mathpad_rows::scheduler::Purpose;
use mathpad_rows::validation::ValidationRun;
use mathpad_rows::{OcrRun, PipelineError};
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn test_three_tile_row_merges_to_one_expression() {
    let h = harness(ScriptedRecognizer::new(THREE_TILE_SCRIPT));
    h.pipeline
        .update_content(RowId(0), three_tile_content(0))
        .await
        .unwrap();

    let run = h.pipeline.run_ocr(RowId(0)).await.unwrap();
    assert_eq!(
        run,
        OcrRun::Complete {
            expression: Some("x^2 + 3xy + y^2 - 5".to_string())
        }
    );

    let row = h.pipeline.row(RowId(0)).await.unwrap();
    assert_eq!(row.ocr_status, OcrStatus::Complete);
    assert_eq!(row.validation_status, ValidationStatus::Pending);
    assert!(row.error_message.is_none());
    assert_eq!(h.recognizer.calls(), 3);
}

#[tokio::test]
async fn test_first_row_validates_without_service() {
    let h = harness(ScriptedRecognizer::new(THREE_TILE_SCRIPT));
    h.pipeline
        .update_content(RowId(0), three_tile_content(0))
        .await
        .unwrap();
    h.pipeline.run_ocr(RowId(0)).await.unwrap();

    match h.pipeline.validate_row(RowId(0)).await.unwrap() {
        ValidationRun::Recorded { result, .. } => {
            assert!(result.equivalent);
            assert_eq!(result.method, ValidationMethod::FirstRow);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.equivalence.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rerunning_identical_content_uses_recognition_cache() {
    let h = harness(ScriptedRecognizer::new(THREE_TILE_SCRIPT));
    h.pipeline.navigate_to(RowId(1)).await.unwrap();
    h.pipeline
        .update_content(RowId(0), three_tile_content(0))
        .await
        .unwrap();
    h.pipeline
        .update_content(RowId(1), three_tile_content(1))
        .await
        .unwrap();

    h.pipeline.run_ocr(RowId(0)).await.unwrap();
    let second = h.pipeline.run_ocr(RowId(1)).await.unwrap();

    // Same glyphs one band lower hash to the same tiles
    assert_eq!(h.recognizer.calls(), 3);
    assert!(matches!(second, OcrRun::Complete { expression: Some(_) }));

    let summary = h.pipeline.validate_all().await;
    assert_eq!(summary.validated, 2);
    assert_eq!(h.equivalence.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deactivation_triggers_debounced_recognition_and_validation() {
    let h = harness(ScriptedRecognizer::new(THREE_TILE_SCRIPT));
    h.pipeline
        .update_content(RowId(0), three_tile_content(0))
        .await
        .unwrap();

    h.pipeline.navigate_to(RowId(1)).await.unwrap();
    assert_eq!(h.pipeline.active_row().await, Some(RowId(1)));
    assert!(h.pipeline.scheduler().is_pending(RowId(0), Purpose::Ocr));
    assert_eq!(
        h.pipeline.row(RowId(0)).await.unwrap().ocr_status,
        OcrStatus::Pending
    );

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(h.recognizer.calls(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let row = h.pipeline.row(RowId(0)).await.unwrap();
    assert_eq!(row.ocr_status, OcrStatus::Complete);
    assert!(h.pipeline.scheduler().is_pending(RowId(0), Purpose::Validation));

    tokio::time::sleep(Duration::from_millis(600)).await;
    let row = h.pipeline.row(RowId(0)).await.unwrap();
    assert_eq!(row.validation_status, ValidationStatus::Validated);
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_content_does_not_retrigger() {
    let h = harness(ScriptedRecognizer::new(THREE_TILE_SCRIPT));
    h.pipeline
        .update_content(RowId(0), three_tile_content(0))
        .await
        .unwrap();
    h.pipeline.run_ocr(RowId(0)).await.unwrap();

    h.pipeline.navigate_to(RowId(1)).await.unwrap();
    assert!(!h.pipeline.scheduler().is_pending(RowId(0), Purpose::Ocr));
    assert_eq!(
        h.pipeline.row(RowId(0)).await.unwrap().ocr_status,
        OcrStatus::Complete
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_recognition_leaves_row_pending_and_cache_empty() {
    let h = harness(
        ScriptedRecognizer::new(THREE_TILE_SCRIPT).with_delay(Duration::from_secs(5)),
    );
    h.pipeline
        .update_content(RowId(0), three_tile_content(0))
        .await
        .unwrap();

    let pipeline = h.pipeline.clone();
    let run = tokio::spawn(async move { pipeline.run_ocr(RowId(0)).await });
    while h.recognizer.started.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(
        h.pipeline.row(RowId(0)).await.unwrap().ocr_status,
        OcrStatus::Processing
    );

    h.pipeline.cancel_ocr(RowId(0)).await.unwrap();
    assert_eq!(run.await.unwrap().unwrap(), OcrRun::Superseded);

    let row = h.pipeline.row(RowId(0)).await.unwrap();
    assert_eq!(row.ocr_status, OcrStatus::Pending);
    assert!(row.expression.is_none());
    assert!(h.pipeline.pool().cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_does_not_touch_other_rows() {
    let h = harness(
        ScriptedRecognizer::new(THREE_TILE_SCRIPT).with_delay(Duration::from_millis(100)),
    );
    h.pipeline.navigate_to(RowId(1)).await.unwrap();
    h.pipeline
        .update_content(RowId(0), three_tile_content(0))
        .await
        .unwrap();
    h.pipeline
        .update_content(RowId(1), narrow_content(1, 50.0))
        .await
        .unwrap();

    let pipeline = h.pipeline.clone();
    let other = tokio::spawn(async move { pipeline.run_ocr(RowId(1)).await });
    let pipeline = h.pipeline.clone();
    let cancelled = tokio::spawn(async move { pipeline.run_ocr(RowId(0)).await });
    while h.recognizer.started.load(Ordering::SeqCst) < 2 {
        tokio::task::yield_now().await;
    }

    h.pipeline.cancel_ocr(RowId(0)).await.unwrap();
    assert_eq!(cancelled.await.unwrap().unwrap(), OcrRun::Superseded);
    // Row 1's glyph is not scripted, so it fails on its own terms
    assert!(matches!(
        other.await.unwrap().unwrap(),
        OcrRun::Failed(PipelineError::RecognitionFailed(_))
    ));
    assert_eq!(
        h.pipeline.row(RowId(1)).await.unwrap().ocr_status,
        OcrStatus::Error
    );
}

#[tokio::test(start_paused = true)]
async fn test_late_failure_of_superseded_run_leaves_newer_run_complete() {
    // First call fails after 100ms, the rerun's call succeeds after 500ms
    let h = harness(
        ScriptedRecognizer::new(&[(167, "x + 1")])
            .failing_first(1)
            .with_call_delays(&[Duration::from_millis(100), Duration::from_millis(500)]),
    );
    h.pipeline
        .update_content(RowId(0), narrow_content(0, 50.0))
        .await
        .unwrap();

    let pipeline = h.pipeline.clone();
    let first = tokio::spawn(async move { pipeline.run_ocr(RowId(0)).await });
    while h.recognizer.started.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    let pipeline = h.pipeline.clone();
    let second = tokio::spawn(async move { pipeline.run_ocr(RowId(0)).await });

    assert_eq!(first.await.unwrap().unwrap(), OcrRun::Superseded);
    assert_eq!(
        second.await.unwrap().unwrap(),
        OcrRun::Complete {
            expression: Some("x + 1".to_string())
        }
    );
    assert_eq!(h.recognizer.calls(), 2);

    let row = h.pipeline.row(RowId(0)).await.unwrap();
    assert_eq!(row.ocr_status, OcrStatus::Complete);
    assert!(row.error_message.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_identical_tiles_in_one_row_are_recognized_once() {
    let h = harness(
        ScriptedRecognizer::new(&[(0, "x"), (130, "+ 1")]).with_delay(Duration::from_millis(50)),
    );
    // Ink at both ends of a 1100px row: tiles at 320 and 640 are both blank
    h.pipeline
        .update_content(
            RowId(0),
            RowContent::new(vec![
                Stroke::line(Point::new(0.0, 10.0), Point::new(10.0, 20.0)),
                Stroke::line(Point::new(1090.0, 10.0), Point::new(1100.0, 20.0)),
            ]),
        )
        .await
        .unwrap();

    let run = h.pipeline.run_ocr(RowId(0)).await.unwrap();
    assert_eq!(
        run,
        OcrRun::Complete {
            expression: Some("x + 1".to_string())
        }
    );
    assert_eq!(h.recognizer.calls(), 3);
    assert_eq!(h.pipeline.pool().stats().invocations, 3);
}

#[tokio::test]
async fn test_tile_failure_marks_only_that_row() {
    let h = harness(ScriptedRecognizer::new(&[(167, "x + 1")]));
    h.pipeline.navigate_to(RowId(1)).await.unwrap();
    h.pipeline
        .update_content(RowId(0), narrow_content(0, 100.0))
        .await
        .unwrap();
    h.pipeline
        .update_content(RowId(1), narrow_content(1, 50.0))
        .await
        .unwrap();

    let failed = h.pipeline.run_ocr(RowId(0)).await.unwrap();
    assert!(matches!(failed, OcrRun::Failed(PipelineError::RecognitionFailed(_))));
    let ok = h.pipeline.run_ocr(RowId(1)).await.unwrap();
    assert_eq!(
        ok,
        OcrRun::Complete {
            expression: Some("x + 1".to_string())
        }
    );

    let row0 = h.pipeline.row(RowId(0)).await.unwrap();
    assert_eq!(row0.ocr_status, OcrStatus::Error);
    assert!(row0.error_message.unwrap().contains("unknown glyph"));
    assert!(row0.expression.is_none());
}

#[tokio::test]
async fn test_unparseable_merge_is_row_error() {
    let h = harness(ScriptedRecognizer::new(&[(167, "(x + 1")]));
    h.pipeline
        .update_content(RowId(0), narrow_content(0, 50.0))
        .await
        .unwrap();

    let run = h.pipeline.run_ocr(RowId(0)).await.unwrap();
    assert!(matches!(run, OcrRun::Failed(PipelineError::InvalidMerge(_))));
    let row = h.pipeline.row(RowId(0)).await.unwrap();
    assert_eq!(row.ocr_status, OcrStatus::Error);
    assert!(row.error_message.unwrap().contains("missing ')'"));
}

#[tokio::test]
async fn test_cleanup_repairs_merge_the_parser_rejects() {
    // The parser only knows ASCII operators; cleanup normalizes the minus sign
    let h = harness(ScriptedRecognizer::new(&[(167, "a \u{2212} b")]));
    h.pipeline
        .update_content(RowId(0), narrow_content(0, 50.0))
        .await
        .unwrap();

    let run = h.pipeline.run_ocr(RowId(0)).await.unwrap();
    assert_eq!(
        run,
        OcrRun::Complete {
            expression: Some("a - b".to_string())
        }
    );
    let row = h.pipeline.row(RowId(0)).await.unwrap();
    assert_eq!(row.ocr_status, OcrStatus::Complete);
    assert_eq!(row.expression.as_deref(), Some("a - b"));
}

#[tokio::test]
async fn test_retry_after_error() {
    let h = harness(ScriptedRecognizer::new(&[(167, "x + 1")]));
    h.pipeline
        .update_content(RowId(0), narrow_content(0, 100.0))
        .await
        .unwrap();
    h.pipeline.run_ocr(RowId(0)).await.unwrap();
    assert_eq!(
        h.pipeline.row(RowId(0)).await.unwrap().ocr_status,
        OcrStatus::Error
    );

    // User fixes the ink and retries explicitly
    h.pipeline
        .update_content(RowId(0), narrow_content(0, 50.0))
        .await
        .unwrap();
    h.pipeline.retry_row(RowId(0)).await.unwrap();

    let row = h.pipeline.row(RowId(0)).await.unwrap();
    assert_eq!(row.ocr_status, OcrStatus::Complete);
    assert_eq!(row.validation_status, ValidationStatus::Validated);
    assert!(row.error_message.is_none());
}

#[tokio::test]
async fn test_empty_row_completes_without_expression() {
    let h = harness(ScriptedRecognizer::new(&[]));
    let run = h.pipeline.run_ocr(RowId(0)).await.unwrap();
    assert_eq!(run, OcrRun::Complete { expression: None });
    assert_eq!(h.recognizer.calls(), 0);
    assert_eq!(
        h.pipeline.validate_row(RowId(0)).await.unwrap(),
        ValidationRun::Skipped
    );
}

#[tokio::test]
async fn test_changing_a_row_invalidates_only_its_successor() {
    let h = harness(ScriptedRecognizer::new(&[]));
    h.pipeline.navigate_to(RowId(2)).await.unwrap();

    let complete = |id: u32, expression: &str| {
        let pipeline = h.pipeline.clone();
        let expression = expression.to_string();
        async move {
            let row = pipeline.row(RowId(id)).await.unwrap();
            if row.ocr_status == OcrStatus::Complete {
                pipeline
                    .update_row(RowId(id), RowPatch::ocr(OcrStatus::Pending))
                    .await
                    .unwrap();
            }
            pipeline
                .update_row(RowId(id), RowPatch::ocr(OcrStatus::Processing))
                .await
                .unwrap();
            pipeline
                .update_row(
                    RowId(id),
                    RowPatch::ocr(OcrStatus::Complete).with_expression(Some(expression)),
                )
                .await
                .unwrap();
        }
    };

    complete(0, "a").await;
    complete(1, "a ").await;
    complete(2, "a  ").await;
    let summary = h.pipeline.validate_all().await;
    assert_eq!(summary.validated, 3);

    let orchestrator = h.pipeline.orchestrator();
    let key_1 = orchestrator.cache_key_for(RowId(1)).unwrap();
    let key_2 = orchestrator.cache_key_for(RowId(2)).unwrap();

    complete(0, "b").await;

    let status = |id: u32| {
        let pipeline = h.pipeline.clone();
        async move { pipeline.row(RowId(id)).await.unwrap().validation_status }
    };
    assert_eq!(status(0).await, ValidationStatus::Pending);
    assert_eq!(status(1).await, ValidationStatus::Pending);
    assert_eq!(status(2).await, ValidationStatus::Validated);
    assert!(!orchestrator.cache().contains(&key_1));
    assert!(orchestrator.cache().contains(&key_2));

    h.pipeline.validate_row(RowId(1)).await.unwrap();
    assert_eq!(status(1).await, ValidationStatus::Invalid);
}

#[tokio::test]
async fn test_exactly_one_active_row_after_any_sequence() {
    let h = harness(ScriptedRecognizer::new(&[]));
    let moves = [3u32, 0, 5, 5, 2, 1, 6, 0];
    for target in moves {
        if target % 2 == 0 {
            h.pipeline.navigate_to(RowId(target)).await.unwrap();
        } else if h.pipeline.set_active_row(RowId(target)).await.is_err() {
            h.pipeline.navigate_to(RowId(target)).await.unwrap();
        }
        let rows = h.pipeline.rows().await;
        assert_eq!(rows.iter().filter(|r| r.is_active).count(), 1);
        assert_eq!(h.pipeline.active_row().await, Some(RowId(target)));
    }

    let timeline = h.pipeline.activation_timeline().await;
    assert!(timeline
        .windows(2)
        .all(|w| w[0].activated_at <= w[1].activated_at));
    assert_eq!(timeline.iter().filter(|e| e.deactivated_at.is_none()).count(), 1);
}

#[tokio::test]
async fn test_set_active_unknown_row_is_not_found() {
    let h = harness(ScriptedRecognizer::new(&[]));
    assert!(matches!(
        h.pipeline.set_active_row(RowId(7)).await,
        Err(PipelineError::RowNotFound(RowId(7)))
    ));
    assert!(matches!(
        h.pipeline
            .update_content(RowId(7), narrow_content(7, 10.0))
            .await,
        Err(PipelineError::RowNotFound(RowId(7)))
    ));
}

#[tokio::test]
async fn test_row_events_are_broadcast() {
    use mathpad_common::events::RowEvent;

    let h = harness(ScriptedRecognizer::new(THREE_TILE_SCRIPT));
    let mut rx = h.pipeline.events().subscribe();
    h.pipeline
        .update_content(RowId(0), three_tile_content(0))
        .await
        .unwrap();
    h.pipeline.navigate_to(RowId(1)).await.unwrap();
    h.pipeline.run_ocr(RowId(0)).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    assert!(seen
        .iter()
        .any(|e| matches!(e, RowEvent::RowCreated { row_id: RowId(1), .. })));
    assert!(seen.iter().any(|e| matches!(
        e,
        RowEvent::RowDeactivated {
            row_id: RowId(0),
            content_changed: true,
            ..
        }
    )));
    assert!(seen.iter().any(|e| matches!(
        e,
        RowEvent::OcrStatusChanged {
            new_status: OcrStatus::Complete,
            ..
        }
    )));
}
