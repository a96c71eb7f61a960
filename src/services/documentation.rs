use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification of a score-mesh node.
#[openapi(
    paths(
        crate::routes::cluster::ping,
        crate::routes::cluster::cluster_status,
        crate::routes::cluster::store_status,
        crate::routes::scores::save_score,
        crate::routes::scores::best_scores,
        crate::routes::replication::apply_change,
        crate::routes::replication::merge_from_remote,
        crate::routes::replication::export_all,
        crate::routes::feed::subscribe_changes,
    ),
    components(
        schemas(
            crate::dao::models::GameMode,
            crate::dto::cluster::PingResponse,
            crate::dto::cluster::ClusterStatusResponse,
            crate::dto::cluster::StoreStatusResponse,
            crate::dto::scores::SaveScoreRequest,
            crate::dto::scores::SaveScoreResponse,
            crate::dto::scores::BestScoresResponse,
            crate::dto::scores::ScoreRow,
            crate::dto::replication::ChangeEvent,
            crate::dto::replication::ApplyChangeResponse,
            crate::dto::replication::MergeRequest,
            crate::dto::replication::MergeResponse,
            crate::dto::replication::ExportResponse,
            crate::dto::feed::FeedMessage,
        )
    ),
    tags(
        (name = "cluster", description = "Liveness and cluster membership"),
        (name = "scores", description = "Game-facing score operations"),
        (name = "replication", description = "Cluster-internal replication"),
        (name = "feed", description = "Server-sent change feed"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_every_endpoint() {
        let doc = ApiDoc::openapi();
        for path in [
            "/ping",
            "/cluster-status",
            "/store-status",
            "/save-score",
            "/best-scores",
            "/apply-change",
            "/subscribe-changes",
            "/merge-from-remote",
            "/export-all",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
