// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[cfg(test)]
mod tests {
    use crate::core::{
        DEFAULT_REJECTION_BODY, FailureCause, Filter, FilterPhase, GatewayCore, GatewayError,
        GatewayRequest, GatewayResponse, HttpMethod, RequestContext, RouteMatch, Router,
        STATE_ANNOTATION,
    };
    use crate::fallback::{
        FallbackProvider, FallbackRegistry, StaticFallbackConfig, StaticFallbackProvider,
        SyntheticResponse,
    };
    use crate::filters::{FilterPipeline, TokenFilter, TokenFilterConfig};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::oneshot;

    /// Answers or fails per route id and counts invocations.
    #[derive(Debug, Default)]
    struct MockRouter {
        calls: AtomicUsize,
        seen_paths: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Router for MockRouter {
        async fn invoke(
            &self,
            route_id: &str,
            request: GatewayRequest,
        ) -> Result<GatewayResponse, FailureCause> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_paths.lock().unwrap().push(request.path.clone());

            match route_id {
                "user-service" | "ok" => Ok(GatewayResponse::new(200, r#"{"id":1}"#)
                    .with_header("content-type", "application/json")),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(GatewayResponse::new(200, "late"))
                }
                "timeout" => Err(FailureCause::Timeout(Duration::from_secs(5))),
                _ => Err(FailureCause::ConnectionRefused(format!("{route_id} is down"))),
            }
        }
    }

    impl MockRouter {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    /// Records which phases it saw and can fail on demand.
    #[derive(Debug)]
    struct PhaseSpy {
        name: &'static str,
        phase: FilterPhase,
        seen: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl Filter for PhaseSpy {
        fn name(&self) -> &str {
            self.name
        }

        fn phase(&self) -> FilterPhase {
            self.phase
        }

        async fn run(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
            let cause = ctx.failure.as_ref().map(|c| c.kind()).unwrap_or("-");
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:{}:{}", self.name, ctx.phase, cause));
            if self.fail {
                return Err(GatewayError::FilterError("spy failure".to_string()));
            }
            Ok(())
        }
    }

    fn spy(
        name: &'static str,
        phase: FilterPhase,
        seen: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<PhaseSpy> {
        Arc::new(PhaseSpy {
            name,
            phase,
            seen: seen.clone(),
            fail: false,
        })
    }

    /// Returns a non-2xx status without a content type.
    #[derive(Debug)]
    struct SloppyProvider;

    impl FallbackProvider for SloppyProvider {
        fn route(&self) -> &str {
            "sloppy"
        }

        fn respond(&self, _cause: &FailureCause) -> SyntheticResponse {
            SyntheticResponse {
                status: 503,
                headers: Default::default(),
                body: "sorry".into(),
            }
        }
    }

    fn user_fallback() -> Arc<dyn FallbackProvider> {
        Arc::new(
            StaticFallbackProvider::new(
                "user-service",
                StaticFallbackConfig {
                    body: "The service is unavailable.".to_string(),
                    ..StaticFallbackConfig::default()
                },
            )
            .unwrap(),
        )
    }

    fn core_with(
        router: Arc<MockRouter>,
        pipeline: FilterPipeline,
        providers: Vec<Arc<dyn FallbackProvider>>,
    ) -> GatewayCore {
        let mut registry = FallbackRegistry::new();
        for provider in providers {
            registry.register(provider).unwrap();
        }
        GatewayCore::new(router, pipeline, registry)
    }

    fn get(path: &str) -> GatewayRequest {
        GatewayRequest::new(HttpMethod::Get, path)
    }

    #[test]
    fn test_route_match_from_first_segment() {
        assert_eq!(
            RouteMatch::from_first_segment("/user-service/u/1"),
            Some(RouteMatch {
                route_id: "user-service".to_string(),
                forward_path: "/u/1".to_string(),
            })
        );
        assert_eq!(
            RouteMatch::from_first_segment("/solo").unwrap().forward_path,
            "/"
        );
        assert!(RouteMatch::from_first_segment("/").is_none());
        assert!(RouteMatch::from_first_segment("").is_none());
    }

    #[test]
    fn test_failure_cause_kinds_and_error_mapping() {
        assert_eq!(FailureCause::Timeout(Duration::from_secs(1)).kind(), "timeout");
        assert_eq!(FailureCause::BackendError { status: 502 }.kind(), "backend-error");
        assert_eq!(
            FailureCause::NoRoute { path: "/".into() }.kind(),
            "no-route"
        );

        assert!(matches!(
            GatewayError::from(FailureCause::Cancelled),
            GatewayError::Cancelled
        ));
        assert!(matches!(
            GatewayError::from(FailureCause::NoRoute { path: "/".into() }),
            GatewayError::RoutingError(_)
        ));
        assert!(matches!(
            GatewayError::from(FailureCause::Filter {
                filter: "f".into(),
                message: "m".into()
            }),
            GatewayError::FilterError(_)
        ));
        assert!(matches!(
            GatewayError::from(FailureCause::NoInstance { route: "r".into() }),
            GatewayError::Upstream(FailureCause::NoInstance { .. })
        ));
    }

    #[test]
    fn test_filter_phase_parsing_and_order() {
        assert_eq!("PRE".parse::<FilterPhase>().unwrap(), FilterPhase::Pre);
        assert_eq!("error".parse::<FilterPhase>().unwrap(), FilterPhase::Error);
        assert!("later".parse::<FilterPhase>().is_err());
        assert!(FilterPhase::Pre < FilterPhase::Route);
        assert!(FilterPhase::Post < FilterPhase::Error);
        assert!(FilterPhase::Route.can_short_circuit());
        assert!(!FilterPhase::Post.can_short_circuit());
    }

    #[test]
    fn test_query_param_decoding() {
        let request = get("/x").with_query("a=1&token=a%2Bb&flag");
        assert_eq!(request.query_param("token").as_deref(), Some("a+b"));
        assert_eq!(request.query_param("flag").as_deref(), Some(""));
        assert!(request.query_param("missing").is_none());
        assert!(get("/x").query_param("a").is_none());
    }

    #[tokio::test]
    async fn test_missing_token_short_circuits_without_backend_call() {
        let router = Arc::new(MockRouter::default());
        let mut pipeline = FilterPipeline::new();
        pipeline.register(Arc::new(TokenFilter::new(TokenFilterConfig::default())));
        let core = core_with(router.clone(), pipeline, vec![user_fallback()]);

        let mut ctx = RequestContext::new(get("/user-service/u/1"));
        let response = core.process(&mut ctx, std::future::pending()).await.unwrap();

        assert_eq!(response.status, 400);
        assert_eq!(&response.body[..], b"token is empty");
        assert_eq!(response.content_type(), Some("text/plain; charset=utf-8"));
        assert_eq!(router.calls(), 0);
        assert_eq!(ctx.annotation(STATE_ANNOTATION), Some(&json!("short-circuited")));
        assert_eq!(ctx.annotation("isSuccess"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn test_token_present_reaches_backend() {
        let router = Arc::new(MockRouter::default());
        let mut pipeline = FilterPipeline::new();
        pipeline.register(Arc::new(TokenFilter::new(TokenFilterConfig::default())));
        let core = core_with(router.clone(), pipeline, vec![user_fallback()]);

        let mut ctx = RequestContext::new(get("/user-service/u/1").with_query("token=abc"));
        let response = core.process(&mut ctx, std::future::pending()).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(&response.body[..], br#"{"id":1}"#);
        assert_eq!(router.calls(), 1);
        assert_eq!(router.seen_paths.lock().unwrap().as_slice(), ["/u/1"]);
        assert_eq!(ctx.route_id.as_deref(), Some("user-service"));
        assert_eq!(ctx.annotation(STATE_ANNOTATION), Some(&json!("responded")));
    }

    #[tokio::test]
    async fn test_rejection_defaults() {
        #[derive(Debug)]
        struct Bouncer;

        #[async_trait]
        impl Filter for Bouncer {
            fn name(&self) -> &str {
                "bouncer"
            }
            fn phase(&self) -> FilterPhase {
                FilterPhase::Route
            }
            async fn run(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
                ctx.should_forward = false;
                Ok(())
            }
        }

        let router = Arc::new(MockRouter::default());
        let mut pipeline = FilterPipeline::new();
        pipeline.register(Arc::new(Bouncer));
        let core = core_with(router.clone(), pipeline, Vec::new());

        let response = core.process_request(get("/ok/x")).await.unwrap();
        assert_eq!(response.status, 400);
        assert_eq!(&response.body[..], DEFAULT_REJECTION_BODY.as_bytes());
        assert_eq!(router.calls(), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_uses_route_fallback() {
        let router = Arc::new(MockRouter::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = FilterPipeline::new();
        pipeline.register(spy("post", FilterPhase::Post, &seen));
        pipeline.register(spy("err", FilterPhase::Error, &seen));
        let core = core_with(
            router.clone(),
            pipeline,
            vec![Arc::new(StaticFallbackProvider::unavailable("billing"))],
        );

        let mut ctx = RequestContext::new(get("/billing/invoices"));
        let response = core.process(&mut ctx, std::future::pending()).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.content_type(), Some("application/json"));
        assert_eq!(&response.body[..], b"The service is unavailable.");
        assert_eq!(ctx.annotation(STATE_ANNOTATION), Some(&json!("fallback")));
        assert_eq!(
            ctx.failure,
            Some(FailureCause::ConnectionRefused("billing is down".to_string()))
        );
        // Post filters never run on a failed call.
        assert_eq!(seen.lock().unwrap().as_slice(), ["err:error:connection-refused"]);
    }

    #[tokio::test]
    async fn test_failure_without_fallback_propagates() {
        let router = Arc::new(MockRouter::default());
        let core = core_with(router.clone(), FilterPipeline::new(), vec![user_fallback()]);

        let mut ctx = RequestContext::new(get("/timeout/x"));
        let err = core
            .process(&mut ctx, std::future::pending())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            GatewayError::Upstream(FailureCause::Timeout(_))
        ));
        assert_eq!(ctx.annotation(STATE_ANNOTATION), Some(&json!("error-propagated")));
    }

    #[tokio::test]
    async fn test_wildcard_covers_unbound_routes_only() {
        let router = Arc::new(MockRouter::default());
        let wildcard = StaticFallbackProvider::new(
            "*",
            StaticFallbackConfig {
                body: "generic".to_string(),
                ..StaticFallbackConfig::default()
            },
        )
        .unwrap();
        let billing = StaticFallbackProvider::new(
            "billing",
            StaticFallbackConfig {
                body: "billing".to_string(),
                ..StaticFallbackConfig::default()
            },
        )
        .unwrap();
        let core = core_with(
            router,
            FilterPipeline::new(),
            vec![Arc::new(wildcard), Arc::new(billing)],
        );

        let response = core.process_request(get("/billing/x")).await.unwrap();
        assert_eq!(&response.body[..], b"billing");

        let response = core.process_request(get("/shipping/x")).await.unwrap();
        assert_eq!(&response.body[..], b"generic");
    }

    #[tokio::test]
    async fn test_unroutable_request_has_no_fallback() {
        let router = Arc::new(MockRouter::default());
        let wildcard = StaticFallbackProvider::unavailable("*");
        let core = core_with(router.clone(), FilterPipeline::new(), vec![Arc::new(wildcard)]);

        let err = core.process_request(get("/")).await.unwrap_err();

        assert!(matches!(err, GatewayError::RoutingError(_)));
        assert_eq!(router.calls(), 0);
    }

    #[tokio::test]
    async fn test_fallback_response_is_coerced_to_success() {
        let router = Arc::new(MockRouter::default());
        let core = core_with(router, FilterPipeline::new(), vec![Arc::new(SloppyProvider)]);

        let response = core.process_request(get("/sloppy/x")).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.content_type(), Some("text/plain; charset=utf-8"));
        assert_eq!(&response.body[..], b"sorry");
    }

    #[tokio::test]
    async fn test_filter_failure_runs_error_phase_and_fallback() {
        let router = Arc::new(MockRouter::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = FilterPipeline::new();
        pipeline.register(Arc::new(PhaseSpy {
            name: "broken",
            phase: FilterPhase::Post,
            seen: seen.clone(),
            fail: true,
        }));
        pipeline.register(spy("err", FilterPhase::Error, &seen));
        let core = core_with(router.clone(), pipeline, vec![user_fallback()]);

        let mut ctx = RequestContext::new(get("/user-service/u/1"));
        let response = core.process(&mut ctx, std::future::pending()).await.unwrap();

        assert_eq!(router.calls(), 1);
        assert_eq!(&response.body[..], b"The service is unavailable.");
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            ["broken:post:-", "err:error:filter"]
        );
        assert!(matches!(ctx.failure, Some(FailureCause::Filter { ref filter, .. }) if filter == "broken"));
    }

    #[tokio::test]
    async fn test_pre_filter_failure_without_fallback() {
        let router = Arc::new(MockRouter::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = FilterPipeline::new();
        pipeline.register(Arc::new(PhaseSpy {
            name: "broken",
            phase: FilterPhase::Pre,
            seen: seen.clone(),
            fail: true,
        }));
        let core = core_with(router.clone(), pipeline, Vec::new());

        let err = core.process_request(get("/ok/x")).await.unwrap_err();

        assert!(matches!(err, GatewayError::FilterError(ref m) if m.contains("broken")));
        assert_eq!(router.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_skips_fallback() {
        let router = Arc::new(MockRouter::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = FilterPipeline::new();
        pipeline.register(spy("err", FilterPhase::Error, &seen));
        let core = core_with(
            router.clone(),
            pipeline,
            vec![Arc::new(StaticFallbackProvider::unavailable("*"))],
        );

        let (tx, rx) = oneshot::channel::<()>();
        let cancel = async move {
            let _ = rx.await;
        };
        let handle = tokio::spawn(async move {
            let mut ctx = RequestContext::new(get("/slow/x"));
            let result = core.process(&mut ctx, cancel).await;
            (result, ctx)
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();

        let (result, ctx) = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(result, Err(GatewayError::Cancelled)));
        assert_eq!(ctx.annotation(STATE_ANNOTATION), Some(&json!("cancelled")));
        assert_eq!(seen.lock().unwrap().as_slice(), ["err:error:cancelled"]);
        assert_eq!(router.calls(), 1);
    }

    #[tokio::test]
    async fn test_process_request_until_completes_when_not_cancelled() {
        let router = Arc::new(MockRouter::default());
        let core = core_with(router, FilterPipeline::new(), Vec::new());

        let response = core
            .process_request_until(get("/ok/x"), std::future::pending())
            .await
            .unwrap();

        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_route_filter_choice_wins_over_resolution() {
        #[derive(Debug)]
        struct Pin;

        #[async_trait]
        impl Filter for Pin {
            fn name(&self) -> &str {
                "pin"
            }
            fn phase(&self) -> FilterPhase {
                FilterPhase::Route
            }
            async fn run(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
                ctx.route_id = Some("ok".to_string());
                ctx.forward_path = Some("/pinned".to_string());
                Ok(())
            }
        }

        let router = Arc::new(MockRouter::default());
        let mut pipeline = FilterPipeline::new();
        pipeline.register(Arc::new(Pin));
        let core = core_with(router.clone(), pipeline, Vec::new());

        let response = core.process_request(get("/anything/else")).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(router.seen_paths.lock().unwrap().as_slice(), ["/pinned"]);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_core() {
        let router = Arc::new(MockRouter::default());
        let core = Arc::new(core_with(
            router.clone(),
            FilterPipeline::new(),
            vec![Arc::new(StaticFallbackProvider::unavailable("*"))],
        ));

        let mut handles = Vec::new();
        for i in 0..16 {
            let core = core.clone();
            let path = if i % 2 == 0 { "/ok/x" } else { "/down/x" };
            handles.push(tokio::spawn(async move {
                core.process_request(get(path)).await.unwrap().status
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 200);
        }
        assert_eq!(router.calls(), 16);
    }
}
