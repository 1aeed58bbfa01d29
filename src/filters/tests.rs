// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[cfg(test)]
mod tests {
    use crate::core::{
        FailureCause, Filter, FilterPhase, GatewayError, GatewayRequest, GatewayResponse,
        HttpMethod, RequestContext,
    };
    use crate::filters::predicates::{
        HeaderPredicate, HeaderPredicateConfig, MethodPredicate, MethodPredicateConfig,
        PathPredicate, PathPredicateConfig, QueryPredicate, QueryPredicateConfig,
        RouteIdPredicate, RouteIdPredicateConfig,
    };
    use crate::filters::{
        AnnotateFilter, AnnotateFilterConfig, FilterConfig, FilterDescriptor, FilterFactory,
        FilterPipeline, HeaderFilter, HeaderFilterConfig, LoggingFilter, LoggingFilterConfig,
        PathRewriteFilter, PathRewriteFilterConfig, PhaseOutcome, Predicate, PredicateFactory,
        RouteFilter, RouteFilterConfig, RouteFilterRule, StaticResponseFilter,
        StaticResponseFilterConfig, TokenFilter, TokenFilterConfig, register_filter,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Appends its name to a shared journal; optionally rejects or fails.
    #[derive(Debug)]
    struct Recorder {
        name: String,
        phase: FilterPhase,
        priority: i32,
        journal: Arc<Mutex<Vec<String>>>,
        reject: bool,
        fail: bool,
    }

    impl Recorder {
        fn new(name: &str, phase: FilterPhase, priority: i32, journal: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                phase,
                priority,
                journal: journal.clone(),
                reject: false,
                fail: false,
            }
        }

        fn rejecting(mut self) -> Self {
            self.reject = true;
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }
    }

    #[async_trait]
    impl Filter for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn phase(&self) -> FilterPhase {
            self.phase
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn run(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
            self.journal.lock().unwrap().push(self.name.clone());
            if self.fail {
                return Err(GatewayError::FilterError(format!("{} blew up", self.name)));
            }
            if self.reject {
                ctx.reject(403, "no");
            }
            Ok(())
        }
    }

    fn ctx(path: &str) -> RequestContext {
        RequestContext::new(GatewayRequest::new(HttpMethod::Get, path))
    }

    fn journal() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(journal: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_pipeline_orders_by_priority_then_registration() {
        let log = journal();
        let mut pipeline = FilterPipeline::new();
        pipeline.register(Arc::new(Recorder::new("late", FilterPhase::Pre, 10, &log)));
        pipeline.register(Arc::new(Recorder::new("first-tie", FilterPhase::Pre, 0, &log)));
        pipeline.register(Arc::new(Recorder::new("early", FilterPhase::Pre, -5, &log)));
        pipeline.register(Arc::new(Recorder::new("second-tie", FilterPhase::Pre, 0, &log)));
        pipeline.register(Arc::new(Recorder::new("post", FilterPhase::Post, -100, &log)));

        assert_eq!(
            pipeline.names(FilterPhase::Pre),
            vec!["early", "first-tie", "second-tie", "late"]
        );
        assert_eq!(pipeline.names(FilterPhase::Post), vec!["post"]);
        assert!(pipeline.names(FilterPhase::Error).is_empty());

        // Same order on every run.
        for _ in 0..3 {
            log.lock().unwrap().clear();
            let mut c = ctx("/a");
            assert!(matches!(
                pipeline.run(FilterPhase::Pre, &mut c).await,
                PhaseOutcome::Completed
            ));
            assert_eq!(entries(&log), vec!["early", "first-tie", "second-tie", "late"]);
        }
    }

    #[tokio::test]
    async fn test_short_circuit_stops_the_phase() {
        let log = journal();
        let mut pipeline = FilterPipeline::new();
        pipeline.register(Arc::new(Recorder::new("gate", FilterPhase::Pre, 0, &log).rejecting()));
        pipeline.register(Arc::new(Recorder::new("after", FilterPhase::Pre, 1, &log)));

        let mut c = ctx("/a");
        let outcome = pipeline.run(FilterPhase::Pre, &mut c).await;

        assert!(matches!(outcome, PhaseOutcome::ShortCircuited));
        assert_eq!(entries(&log), vec!["gate"]);
        assert!(!c.should_forward);
        assert_eq!(c.status_override, Some(403));

        // A later phase that can short-circuit does not run at all.
        let outcome = pipeline.run(FilterPhase::Route, &mut c).await;
        assert!(matches!(outcome, PhaseOutcome::ShortCircuited));
    }

    #[tokio::test]
    async fn test_post_phase_ignores_should_forward() {
        let log = journal();
        let mut pipeline = FilterPipeline::new();
        pipeline.register(Arc::new(Recorder::new("p1", FilterPhase::Post, 0, &log).rejecting()));
        pipeline.register(Arc::new(Recorder::new("p2", FilterPhase::Post, 1, &log)));

        let mut c = ctx("/a");
        assert!(matches!(
            pipeline.run(FilterPhase::Post, &mut c).await,
            PhaseOutcome::Completed
        ));
        assert_eq!(entries(&log), vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn test_failure_stops_phase_except_error_phase() {
        let log = journal();
        let mut pipeline = FilterPipeline::new();
        pipeline.register(Arc::new(Recorder::new("boom", FilterPhase::Pre, 0, &log).failing()));
        pipeline.register(Arc::new(Recorder::new("skipped", FilterPhase::Pre, 1, &log)));
        pipeline.register(Arc::new(Recorder::new("err-boom", FilterPhase::Error, 0, &log).failing()));
        pipeline.register(Arc::new(Recorder::new("err-next", FilterPhase::Error, 1, &log)));

        let mut c = ctx("/a");
        match pipeline.run(FilterPhase::Pre, &mut c).await {
            PhaseOutcome::Failed { filter, error } => {
                assert_eq!(filter, "boom");
                assert!(error.to_string().contains("boom blew up"));
            }
            other => panic!("expected failure, got {other:?}"),
        }

        let outcome = pipeline.run(FilterPhase::Error, &mut c).await;
        assert!(matches!(outcome, PhaseOutcome::Completed));
        assert_eq!(entries(&log), vec!["boom", "err-boom", "err-next"]);
    }

    #[tokio::test]
    async fn test_descriptor_overrides_phase_priority_and_predicates() {
        let log = journal();
        let mut pipeline = FilterPipeline::new();
        let only_admin: Arc<dyn Predicate> = Arc::new(
            PathPredicate::new(PathPredicateConfig {
                pattern: "/admin/*".to_string(),
            })
            .unwrap(),
        );

        pipeline.register_with(
            Arc::new(Recorder::new("moved", FilterPhase::Pre, 0, &log)),
            FilterDescriptor {
                phase: Some(FilterPhase::Route),
                priority: Some(-1),
                when: vec![only_admin],
            },
        );
        pipeline.register(Arc::new(Recorder::new("route", FilterPhase::Route, 0, &log)));

        assert_eq!(pipeline.names(FilterPhase::Route), vec!["moved", "route"]);
        assert!(pipeline.names(FilterPhase::Pre).is_empty());

        let mut c = ctx("/public/x");
        pipeline.run(FilterPhase::Route, &mut c).await;
        assert_eq!(entries(&log), vec!["route"]);

        log.lock().unwrap().clear();
        let mut c = ctx("/admin/x");
        pipeline.run(FilterPhase::Route, &mut c).await;
        assert_eq!(entries(&log), vec!["moved", "route"]);
    }

    #[tokio::test]
    async fn test_token_filter_accepts_and_rejects() {
        let filter = TokenFilter::new(TokenFilterConfig::default());

        let mut with_token = RequestContext::new(
            GatewayRequest::new(HttpMethod::Get, "/user-service/u/1").with_query("token=abc"),
        );
        filter.run(&mut with_token).await.unwrap();
        assert!(with_token.should_forward);
        assert_eq!(with_token.annotation("isSuccess"), Some(&json!(true)));

        let mut without = ctx("/user-service/u/1");
        filter.run(&mut without).await.unwrap();
        assert!(!without.should_forward);
        assert_eq!(without.status_override, Some(400));
        assert_eq!(without.body_override.as_deref(), Some("token is empty".as_bytes()));
        assert_eq!(without.annotation("isSuccess"), Some(&json!(false)));

        let mut blank = RequestContext::new(
            GatewayRequest::new(HttpMethod::Get, "/x").with_query("token=%20"),
        );
        filter.run(&mut blank).await.unwrap();
        assert!(!blank.should_forward);
    }

    #[tokio::test]
    async fn test_token_filter_header_and_observe_mode() {
        let filter = TokenFilter::new(TokenFilterConfig {
            header: Some("x-api-token".to_string()),
            ..TokenFilterConfig::default()
        });
        let mut c = RequestContext::new(
            GatewayRequest::new(HttpMethod::Get, "/x").with_header("x-api-token", "t"),
        );
        filter.run(&mut c).await.unwrap();
        assert!(c.should_forward);

        let mut empty_query = RequestContext::new(
            GatewayRequest::new(HttpMethod::Get, "/x")
                .with_query("token=")
                .with_header("x-api-token", "t"),
        );
        filter.run(&mut empty_query).await.unwrap();
        assert!(empty_query.should_forward);
        assert_eq!(empty_query.annotation("isSuccess"), Some(&json!(true)));

        let mut both_blank = RequestContext::new(
            GatewayRequest::new(HttpMethod::Get, "/x")
                .with_query("token=")
                .with_header("x-api-token", " "),
        );
        filter.run(&mut both_blank).await.unwrap();
        assert!(!both_blank.should_forward);

        let observing = TokenFilter::new(TokenFilterConfig {
            enforce: false,
            ..TokenFilterConfig::default()
        });
        let mut c = ctx("/x");
        observing.run(&mut c).await.unwrap();
        assert!(c.should_forward);
    }

    #[tokio::test]
    async fn test_static_response_filter_seeds_response() {
        let filter = StaticResponseFilter::new(StaticResponseFilterConfig {
            status: 503,
            body: "maintenance".to_string(),
            content_type: "text/html".to_string(),
        });
        let mut c = ctx("/anything");
        filter.run(&mut c).await.unwrap();

        assert!(!c.should_forward);
        assert_eq!(c.status_override, Some(503));
        let seeded = c.response.as_ref().unwrap();
        assert_eq!(seeded.content_type(), Some("text/html"));
    }

    #[tokio::test]
    async fn test_header_filter_by_phase() {
        let mut add_request_headers = HashMap::new();
        add_request_headers.insert("x-gateway".to_string(), "fallgate".to_string());
        let mut add_response_headers = HashMap::new();
        add_response_headers.insert("x-served-by".to_string(), "gw-1".to_string());

        let filter = HeaderFilter::new(HeaderFilterConfig {
            add_request_headers,
            remove_request_headers: vec!["cookie".to_string()],
            add_response_headers,
            remove_response_headers: vec!["server".to_string()],
        });

        let mut c = RequestContext::new(
            GatewayRequest::new(HttpMethod::Get, "/x").with_header("cookie", "secret"),
        );
        c.phase = FilterPhase::Pre;
        filter.run(&mut c).await.unwrap();
        assert_eq!(c.request.header("x-gateway"), Some("fallgate"));
        assert!(c.request.header("cookie").is_none());

        c.phase = FilterPhase::Post;
        c.response = Some(GatewayResponse::new(200, "ok").with_header("server", "nginx"));
        filter.run(&mut c).await.unwrap();
        let response = c.response.as_ref().unwrap();
        assert_eq!(response.headers["x-served-by"], "gw-1");
        assert!(!response.headers.contains_key("server"));
    }

    #[tokio::test]
    async fn test_path_rewrite_prefers_forward_path() {
        let filter = PathRewriteFilter::new(PathRewriteFilterConfig {
            pattern: "^/v1/".to_string(),
            replacement: "/api/v1/".to_string(),
        })
        .unwrap();

        let mut c = ctx("/v1/users");
        filter.run(&mut c).await.unwrap();
        assert_eq!(c.request.path, "/api/v1/users");

        let mut routed = ctx("/svc/v1/users");
        routed.forward_path = Some("/v1/users".to_string());
        filter.run(&mut routed).await.unwrap();
        assert_eq!(routed.forward_path.as_deref(), Some("/api/v1/users"));
        assert_eq!(routed.request.path, "/svc/v1/users");

        assert!(PathRewriteFilter::new(PathRewriteFilterConfig {
            pattern: "(".to_string(),
            replacement: String::new(),
        })
        .is_err());
    }

    #[tokio::test]
    async fn test_route_filter_claims_matching_paths() {
        let filter = RouteFilter::new(RouteFilterConfig {
            routes: vec![
                RouteFilterRule {
                    id: "user-service".to_string(),
                    path: "/users/*".to_string(),
                    strip_prefix: true,
                },
                RouteFilterRule {
                    id: "legacy".to_string(),
                    path: "/old/*".to_string(),
                    strip_prefix: false,
                },
            ],
        })
        .unwrap();

        let mut c = ctx("/users/42/profile");
        assert!(filter.should_filter(&c));
        filter.run(&mut c).await.unwrap();
        assert_eq!(c.route_id.as_deref(), Some("user-service"));
        assert_eq!(c.forward_path.as_deref(), Some("/42/profile"));
        assert!(!filter.should_filter(&c));

        let mut c = ctx("/old/thing");
        filter.run(&mut c).await.unwrap();
        assert_eq!(c.route_id.as_deref(), Some("legacy"));
        assert_eq!(c.forward_path.as_deref(), Some("/old/thing"));

        let mut c = ctx("/elsewhere");
        filter.run(&mut c).await.unwrap();
        assert!(c.route_id.is_none());
    }

    #[tokio::test]
    async fn test_annotate_and_logging_filters() {
        let mut annotations = HashMap::new();
        annotations.insert("tier".to_string(), json!("gold"));
        let annotate = AnnotateFilter::new(AnnotateFilterConfig { annotations });
        let logging = LoggingFilter::new(LoggingFilterConfig {
            log_body: true,
            max_body_size: 2,
            ..LoggingFilterConfig::default()
        });

        let mut c = ctx("/x");
        annotate.run(&mut c).await.unwrap();
        assert_eq!(c.annotation("tier"), Some(&json!("gold")));

        for phase in [FilterPhase::Pre, FilterPhase::Post, FilterPhase::Error] {
            c.phase = phase;
            c.response = Some(GatewayResponse::new(200, "long body"));
            c.failure = Some(FailureCause::BackendError { status: 500 });
            logging.run(&mut c).await.unwrap();
        }
    }

    #[test]
    fn test_predicates() {
        let mut c = RequestContext::new(
            GatewayRequest::new(HttpMethod::Post, "/api/v2/items")
                .with_query("debug=1&name=a%20b")
                .with_header("x-tenant", "acme-corp"),
        );
        c.route_id = Some("items".to_string());

        let path = PathPredicate::new(PathPredicateConfig {
            pattern: "/api/:version/*".to_string(),
        })
        .unwrap();
        assert!(path.matches(&c));

        let method = MethodPredicate::new(MethodPredicateConfig {
            methods: vec![HttpMethod::Get],
        });
        assert!(!method.matches(&c));

        let mut headers = HashMap::new();
        headers.insert("x-tenant".to_string(), "acme".to_string());
        let loose = HeaderPredicate::new(HeaderPredicateConfig {
            headers: headers.clone(),
            exact_match: false,
        });
        let exact = HeaderPredicate::new(HeaderPredicateConfig {
            headers,
            exact_match: true,
        });
        assert!(loose.matches(&c));
        assert!(!exact.matches(&c));

        let mut params = HashMap::new();
        params.insert("name".to_string(), "a b".to_string());
        let query = QueryPredicate::new(QueryPredicateConfig {
            params,
            exact_match: true,
        });
        assert!(query.matches(&c));

        let route = RouteIdPredicate::new(RouteIdPredicateConfig {
            routes: vec!["items".to_string()],
        });
        assert!(route.matches(&c));
        assert_eq!(route.predicate_type(), "route");
    }

    #[test]
    fn test_predicate_factory_errors() {
        assert!(PredicateFactory::create_predicate("path", json!({ "pattern": "/a/*" })).is_ok());
        assert!(matches!(
            PredicateFactory::create_predicate("path", json!({})),
            Err(GatewayError::ConfigError(_))
        ));
        assert!(matches!(
            PredicateFactory::create_predicate("moon-phase", json!({})),
            Err(GatewayError::ConfigError(_))
        ));
    }

    #[test]
    fn test_filter_factory_builtins_and_errors() {
        for (kind, config) in [
            ("token", json!({})),
            ("static_response", json!({ "body": "hi" })),
            ("header", json!({})),
            ("path_rewrite", json!({ "pattern": "^/a", "replacement": "/b" })),
            ("route", json!({ "routes": [{ "id": "a", "path": "/a/*" }] })),
            ("annotate", json!({ "annotations": { "k": 1 } })),
            ("logging", json!({ "log_level": "debug" })),
        ] {
            let filter = FilterFactory::create_filter(kind, config).unwrap();
            assert_eq!(filter.name(), kind);
        }

        assert!(matches!(
            FilterFactory::create_filter("nope", json!({})),
            Err(GatewayError::FilterError(_))
        ));
        assert!(matches!(
            FilterFactory::create_filter("token", json!({ "enforce": "yes" })),
            Err(GatewayError::FilterError(_))
        ));
    }

    #[test]
    fn test_registered_filter_types_are_used() {
        #[derive(Debug)]
        struct Custom;

        #[async_trait]
        impl Filter for Custom {
            fn name(&self) -> &str {
                "custom"
            }
            fn phase(&self) -> FilterPhase {
                FilterPhase::Error
            }
            async fn run(&self, _ctx: &mut RequestContext) -> Result<(), GatewayError> {
                Ok(())
            }
        }

        register_filter("custom", |_| Ok(Arc::new(Custom)));
        let filter = FilterFactory::create_filter("custom", json!({})).unwrap();
        assert_eq!(filter.phase(), FilterPhase::Error);
    }

    #[test]
    fn test_filter_config_entry() {
        let entry: FilterConfig = serde_json::from_value(json!({
            "type": "header",
            "phase": "pre",
            "priority": -10,
            "when": [{ "type": "method", "config": { "methods": ["POST"] } }]
        }))
        .unwrap();

        assert_eq!(entry.config, json!({}));
        let descriptor = entry.descriptor().unwrap();
        assert_eq!(descriptor.phase, Some(FilterPhase::Pre));
        assert_eq!(descriptor.priority, Some(-10));
        assert_eq!(descriptor.when.len(), 1);
    }
}
