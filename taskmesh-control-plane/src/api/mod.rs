//! The HTTP surface the core touches (§6): executor registration/heartbeat,
//! execution create/status/stop, and task result/screenshot/distribute.
//! Built the way the teacher composes a `poem_openapi::OpenApiService` from
//! per-resource `Api` structs (see `cloud-component-service::api`).

pub mod executions;
pub mod executor;
pub mod tasks;

use crate::services::Services;
use poem::Route;
use poem_openapi::{OpenApiService, Tags};
use taskmesh_service_base::api::HealthcheckApi;

#[derive(Tags)]
enum ApiTags {
    Executor,
    Execution,
    Task,
    HealthCheck,
}

type ApiServices = (
    executor::ExecutorApi,
    executions::ExecutionApi,
    tasks::TaskApi,
    HealthcheckApi,
);

pub fn make_open_api_service(services: &Services) -> OpenApiService<ApiServices, ()> {
    OpenApiService::new(
        (
            executor::ExecutorApi::new(services.registrar.clone()),
            executions::ExecutionApi::new(services.execution_service.clone(), services.stop_controller.clone()),
            tasks::TaskApi::new(services.result_handler.clone(), services.screenshot_service.clone(), services.dispatcher.clone()),
            HealthcheckApi,
        ),
        "TaskMesh Control Plane API",
        "1.0",
    )
}

pub fn combined_routes(services: &Services) -> Route {
    let api_service = make_open_api_service(services);
    let ui = api_service.swagger_ui();
    let spec = api_service.spec_endpoint_yaml();

    Route::new()
        .nest("/", api_service)
        .nest("/docs", ui)
        .nest("/specs", spec)
}
