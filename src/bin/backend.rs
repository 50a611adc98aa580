use std::{
    collections::HashMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{
        FromRequestParts, Multipart, Path as AxumPath, Query, State,
        multipart::{MultipartError, MultipartRejection},
        rejection::JsonRejection,
    },
    http::{HeaderMap, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use clap::Parser;
use mime_guess::MimeGuess;
use serde::Deserialize;
use tempfile::TempDir;
use tokio::{
    fs::File,
    io::AsyncWriteExt,
    signal,
};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use vidtube_backend::{
    Core, CoreError, CoreResult,
    api::ApiResponse,
    blob::{BlobKind, LocalBlobStore},
    config::{DEFAULT_CONFIG_PATH, load_runtime_config_from},
    model::{Comment, Playlist, Tweet, Video},
    paginate::{Page, PageRequest},
    store::EntityStore,
    users::NewUser,
    videos::{NewVideo, VideoListParams, VideoUpdate},
    views::{
        CommentView, LikeStatus, LikedVideoEntry, PlaylistDetail, PlaylistSummary,
        PublishStatus, SubscribedChannelEntry, SubscriberEntry, SubscriptionStatus, TweetView,
        UserProfile, VideoDetail, VideoFeedItem, VideoSummary,
    },
};

const USER_HEADER: &str = "x-user-id";

#[derive(Parser, Debug)]
#[command(name = "backend", about = "Video platform API server")]
struct Args {
    /// Key/value env file with DATABASE_PATH, MEDIA_ROOT and friends.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Clone)]
struct AppState {
    core: Core,
    blobs: Arc<LocalBlobStore>,
    staging: Arc<TempDir>,
}

type ApiResult<T> = CoreResult<ApiResponse<T>>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = load_runtime_config_from(&args.config)?;

    std::fs::create_dir_all(&config.media_root)
        .with_context(|| format!("creating media root {}", config.media_root.display()))?;
    let store = EntityStore::open(&config.database_path)
        .with_context(|| format!("opening database {}", config.database_path.display()))?;
    let blobs = Arc::new(LocalBlobStore::new(
        config.media_root.clone(),
        config.public_media_url.clone(),
    ));
    let staging = tempfile::Builder::new()
        .prefix("vidtube-uploads")
        .tempdir()
        .context("creating upload staging directory")?;

    let state = AppState {
        core: Core::new(store, blobs.clone()),
        blobs,
        staging: Arc::new(staging),
    };

    let host = args.host.unwrap_or(config.vidtube_host);
    let port = args.port.unwrap_or(config.vidtube_port);
    let addr = SocketAddr::new(
        host.parse().with_context(|| format!("invalid host {host}"))?,
        port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("API server listening on http://{}", addr);

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    state.core.effects().flush().await;
    let stats = state.core.effects().stats();
    info!(
        completed = stats.completed,
        failed = stats.failed,
        "side effects drained"
    );
    Ok(())
}

fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/users/register", post(register_user))
        .route("/users/history", get(watch_history))
        .route("/videos", get(list_videos).post(publish_video))
        .route(
            "/videos/{video_id}",
            get(get_video).patch(update_video).delete(delete_video),
        )
        .route("/videos/toggle/publish/{video_id}", patch(toggle_publish))
        .route(
            "/comments/{video_id}",
            get(list_comments).post(add_comment),
        )
        .route(
            "/comments/c/{comment_id}",
            patch(update_comment).delete(delete_comment),
        )
        .route("/tweets", post(create_tweet))
        .route("/tweets/user/{user_id}", get(list_tweets))
        .route(
            "/tweets/{tweet_id}",
            patch(update_tweet).delete(delete_tweet),
        )
        .route("/likes/toggle/v/{video_id}", post(toggle_video_like))
        .route("/likes/toggle/c/{comment_id}", post(toggle_comment_like))
        .route("/likes/toggle/t/{tweet_id}", post(toggle_tweet_like))
        .route("/likes/videos", get(liked_videos))
        .route(
            "/subscriptions/c/{channel_id}",
            get(channel_subscribers).post(toggle_subscription),
        )
        .route(
            "/subscriptions/u/{subscriber_id}",
            get(subscribed_channels),
        )
        .route("/playlist", post(create_playlist))
        .route(
            "/playlist/{playlist_id}",
            get(get_playlist)
                .patch(update_playlist)
                .delete(delete_playlist),
        )
        .route(
            "/playlist/add/{video_id}/{playlist_id}",
            patch(add_to_playlist),
        )
        .route(
            "/playlist/remove/{video_id}/{playlist_id}",
            patch(remove_from_playlist),
        )
        .route("/playlist/user/{user_id}", get(user_playlists));

    Router::new()
        .nest("/api/v1", api)
        .route("/media/{kind}/{file}", get(serve_media))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", err);
    }
}

/// Identity supplied by the upstream session layer, if any. A header that
/// is present but malformed is rejected rather than treated as anonymous.
struct Viewer(Option<Uuid>);

/// Viewer identity required by mutations; must name a registered user.
struct Actor(Uuid);

fn viewer_id(headers: &HeaderMap) -> CoreResult<Option<Uuid>> {
    let Some(value) = headers.get(USER_HEADER) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
        .map(Some)
        .ok_or_else(|| CoreError::Unauthorized("invalid user identity".into()))
}

impl<S: Send + Sync> FromRequestParts<S> for Viewer {
    type Rejection = CoreError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        viewer_id(&parts.headers).map(Viewer)
    }
}

impl FromRequestParts<AppState> for Actor {
    type Rejection = CoreError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let id = viewer_id(&parts.headers)?
            .ok_or_else(|| CoreError::Unauthorized("login required".into()))?;
        if state.core.store().get_user(id).await?.is_none() {
            return Err(CoreError::Unauthorized("unknown user".into()));
        }
        Ok(Actor(id))
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> CoreResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|err| CoreError::invalid(format!("invalid request body: {err}")))
}

fn bad_multipart(err: MultipartError) -> CoreError {
    CoreError::invalid(format!("invalid multipart body: {err}"))
}

/// A file part written to the staging directory. The blob store moves it
/// away on success; whatever is left when the form is dropped is removed.
struct StagedFile(PathBuf);

impl Drop for StagedFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

#[derive(Default)]
struct UploadForm {
    fields: HashMap<String, String>,
    files: HashMap<String, StagedFile>,
}

impl UploadForm {
    fn text(&self, name: &str) -> String {
        self.fields.get(name).cloned().unwrap_or_default()
    }

    fn file(&self, name: &str) -> Option<PathBuf> {
        self.files.get(name).map(|staged| staged.0.clone())
    }
}

fn staged_name(file_name: &str) -> String {
    let id = Uuid::new_v4().simple();
    match Path::new(file_name).extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.chars().all(|c| c.is_ascii_alphanumeric()) => format!("{id}.{ext}"),
        _ => id.to_string(),
    }
}

async fn read_form(
    staging: &Path,
    multipart: Result<Multipart, MultipartRejection>,
) -> CoreResult<UploadForm> {
    let mut multipart =
        multipart.map_err(|err| CoreError::invalid(format!("expected a multipart form: {err}")))?;
    let mut form = UploadForm::default();

    while let Some(mut field) = multipart.next_field().await.map_err(bad_multipart)? {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        let file_name = field
            .file_name()
            .filter(|file_name| !file_name.is_empty())
            .map(str::to_owned);
        match file_name {
            Some(file_name) => {
                let staged = StagedFile(staging.join(staged_name(&file_name)));
                let mut out = File::create(&staged.0).await?;
                while let Some(chunk) = field.chunk().await.map_err(bad_multipart)? {
                    out.write_all(&chunk).await?;
                }
                out.flush().await?;
                form.files.insert(name, staged);
            }
            None => {
                let text = field.text().await.map_err(bad_multipart)?;
                form.fields.insert(name, text);
            }
        }
    }

    Ok(form)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    page: Option<String>,
    limit: Option<String>,
    query: Option<String>,
    sort_by: Option<String>,
    sort_type: Option<String>,
    user_id: Option<String>,
}

impl ListQuery {
    fn page(&self) -> PageRequest {
        PageRequest::from_raw(self.page.as_deref(), self.limit.as_deref())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ContentBody {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct PlaylistBody {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
}

async fn healthcheck() -> ApiResponse<&'static str> {
    ApiResponse::ok("OK", "Health check passed")
}

async fn register_user(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<UserProfile> {
    let form = read_form(state.staging.path(), multipart).await?;
    let profile = state
        .core
        .register_user(NewUser {
            username: form.text("username"),
            full_name: form.text("fullName"),
            email: form.text("email"),
            avatar: form.file("avatar"),
        })
        .await?;
    Ok(ApiResponse::created(profile, "User registered successfully"))
}

async fn watch_history(
    State(state): State<AppState>,
    Actor(actor): Actor,
) -> ApiResult<Vec<VideoSummary>> {
    let history = state.core.get_watch_history(actor).await?;
    Ok(ApiResponse::ok(history, "Watch history fetched successfully"))
}

async fn list_videos(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Query(query): Query<ListQuery>,
) -> ApiResult<Page<VideoFeedItem>> {
    let params = VideoListParams {
        page: query.page(),
        query: query.query,
        sort_by: query.sort_by,
        sort_type: query.sort_type,
        user_id: query.user_id,
    };
    let videos = state.core.get_all_videos(viewer, params).await?;
    Ok(ApiResponse::ok(videos, "Videos fetched successfully"))
}

async fn publish_video(
    State(state): State<AppState>,
    Actor(actor): Actor,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Video> {
    let form = read_form(state.staging.path(), multipart).await?;
    let duration = match form.fields.get("duration").map(|raw| raw.trim()) {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<f64>()
                .ok()
                .filter(|value| value.is_finite() && *value >= 0.0)
                .ok_or_else(|| CoreError::invalid("invalid duration"))?,
        ),
    };
    let video = state
        .core
        .publish_video(
            actor,
            NewVideo {
                title: form.text("title"),
                description: form.text("description"),
                video_file: form.file("videoFile"),
                thumbnail: form.file("thumbnail"),
                duration,
            },
        )
        .await?;
    Ok(ApiResponse::created(video, "Video uploaded successfully"))
}

async fn get_video(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    AxumPath(video_id): AxumPath<String>,
) -> ApiResult<VideoDetail> {
    let video = state.core.get_video_by_id(viewer, &video_id).await?;
    Ok(ApiResponse::ok(video, "Video fetched successfully"))
}

async fn update_video(
    State(state): State<AppState>,
    Actor(actor): Actor,
    AxumPath(video_id): AxumPath<String>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Video> {
    let form = read_form(state.staging.path(), multipart).await?;
    let video = state
        .core
        .update_video(
            actor,
            &video_id,
            VideoUpdate {
                title: form.text("title"),
                description: form.text("description"),
                thumbnail: form.file("thumbnail"),
            },
        )
        .await?;
    Ok(ApiResponse::ok(video, "Video updated successfully"))
}

async fn delete_video(
    State(state): State<AppState>,
    Actor(actor): Actor,
    AxumPath(video_id): AxumPath<String>,
) -> ApiResult<()> {
    state.core.delete_video(actor, &video_id).await?;
    Ok(ApiResponse::ok((), "Video deleted successfully"))
}

async fn toggle_publish(
    State(state): State<AppState>,
    Actor(actor): Actor,
    AxumPath(video_id): AxumPath<String>,
) -> ApiResult<PublishStatus> {
    let status = state.core.toggle_publish_status(actor, &video_id).await?;
    let message = if status.is_published {
        "Video published"
    } else {
        "Video unpublished"
    };
    Ok(ApiResponse::ok(status, message))
}

async fn list_comments(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    AxumPath(video_id): AxumPath<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Page<CommentView>> {
    let comments = state
        .core
        .get_video_comments(viewer, &video_id, query.page())
        .await?;
    Ok(ApiResponse::ok(comments, "Comments fetched successfully"))
}

async fn add_comment(
    State(state): State<AppState>,
    Actor(actor): Actor,
    AxumPath(video_id): AxumPath<String>,
    payload: Result<Json<ContentBody>, JsonRejection>,
) -> ApiResult<Comment> {
    let input = body(payload)?;
    let comment = state
        .core
        .add_comment(actor, &video_id, &input.content)
        .await?;
    Ok(ApiResponse::created(comment, "Comment added successfully"))
}

async fn update_comment(
    State(state): State<AppState>,
    Actor(actor): Actor,
    AxumPath(comment_id): AxumPath<String>,
    payload: Result<Json<ContentBody>, JsonRejection>,
) -> ApiResult<Comment> {
    let input = body(payload)?;
    let comment = state
        .core
        .update_comment(actor, &comment_id, &input.content)
        .await?;
    Ok(ApiResponse::ok(comment, "Comment updated successfully"))
}

async fn delete_comment(
    State(state): State<AppState>,
    Actor(actor): Actor,
    AxumPath(comment_id): AxumPath<String>,
) -> ApiResult<()> {
    state.core.delete_comment(actor, &comment_id).await?;
    Ok(ApiResponse::ok((), "Comment deleted successfully"))
}

async fn create_tweet(
    State(state): State<AppState>,
    Actor(actor): Actor,
    payload: Result<Json<ContentBody>, JsonRejection>,
) -> ApiResult<Tweet> {
    let input = body(payload)?;
    let tweet = state.core.create_tweet(actor, &input.content).await?;
    Ok(ApiResponse::created(tweet, "Tweet created successfully"))
}

async fn list_tweets(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    AxumPath(user_id): AxumPath<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Page<TweetView>> {
    let tweets = state
        .core
        .get_user_tweets(viewer, &user_id, query.page())
        .await?;
    Ok(ApiResponse::ok(tweets, "Tweets fetched successfully"))
}

async fn update_tweet(
    State(state): State<AppState>,
    Actor(actor): Actor,
    AxumPath(tweet_id): AxumPath<String>,
    payload: Result<Json<ContentBody>, JsonRejection>,
) -> ApiResult<Tweet> {
    let input = body(payload)?;
    let tweet = state
        .core
        .update_tweet(actor, &tweet_id, &input.content)
        .await?;
    Ok(ApiResponse::ok(tweet, "Tweet updated successfully"))
}

async fn delete_tweet(
    State(state): State<AppState>,
    Actor(actor): Actor,
    AxumPath(tweet_id): AxumPath<String>,
) -> ApiResult<()> {
    state.core.delete_tweet(actor, &tweet_id).await?;
    Ok(ApiResponse::ok((), "Tweet deleted successfully"))
}

fn like_message(status: LikeStatus, subject: &str) -> String {
    if status.is_liked {
        format!("{subject} liked")
    } else {
        format!("{subject} unliked")
    }
}

async fn toggle_video_like(
    State(state): State<AppState>,
    Actor(actor): Actor,
    AxumPath(video_id): AxumPath<String>,
) -> ApiResult<LikeStatus> {
    let status = state.core.toggle_video_like(actor, &video_id).await?;
    Ok(ApiResponse::ok(status, like_message(status, "Video")))
}

async fn toggle_comment_like(
    State(state): State<AppState>,
    Actor(actor): Actor,
    AxumPath(comment_id): AxumPath<String>,
) -> ApiResult<LikeStatus> {
    let status = state.core.toggle_comment_like(actor, &comment_id).await?;
    Ok(ApiResponse::ok(status, like_message(status, "Comment")))
}

async fn toggle_tweet_like(
    State(state): State<AppState>,
    Actor(actor): Actor,
    AxumPath(tweet_id): AxumPath<String>,
) -> ApiResult<LikeStatus> {
    let status = state.core.toggle_tweet_like(actor, &tweet_id).await?;
    Ok(ApiResponse::ok(status, like_message(status, "Tweet")))
}

async fn liked_videos(
    State(state): State<AppState>,
    Actor(actor): Actor,
) -> ApiResult<Vec<LikedVideoEntry>> {
    let videos = state.core.get_liked_videos(actor).await?;
    Ok(ApiResponse::ok(videos, "Liked videos fetched successfully"))
}

async fn toggle_subscription(
    State(state): State<AppState>,
    Actor(actor): Actor,
    AxumPath(channel_id): AxumPath<String>,
) -> ApiResult<SubscriptionStatus> {
    let status = state.core.toggle_subscription(actor, &channel_id).await?;
    let message = if status.subscribed {
        "Subscribed successfully"
    } else {
        "Unsubscribed successfully"
    };
    Ok(ApiResponse::ok(status, message))
}

async fn channel_subscribers(
    State(state): State<AppState>,
    AxumPath(channel_id): AxumPath<String>,
) -> ApiResult<Vec<SubscriberEntry>> {
    let subscribers = state.core.get_user_channel_subscribers(&channel_id).await?;
    Ok(ApiResponse::ok(subscribers, "Subscribers fetched successfully"))
}

async fn subscribed_channels(
    State(state): State<AppState>,
    AxumPath(subscriber_id): AxumPath<String>,
) -> ApiResult<Vec<SubscribedChannelEntry>> {
    let channels = state.core.get_subscribed_channels(&subscriber_id).await?;
    Ok(ApiResponse::ok(
        channels,
        "Subscribed channels fetched successfully",
    ))
}

async fn create_playlist(
    State(state): State<AppState>,
    Actor(actor): Actor,
    payload: Result<Json<PlaylistBody>, JsonRejection>,
) -> ApiResult<Playlist> {
    let input = body(payload)?;
    let playlist = state
        .core
        .create_playlist(actor, &input.name, &input.description)
        .await?;
    Ok(ApiResponse::created(playlist, "Playlist created successfully"))
}

async fn get_playlist(
    State(state): State<AppState>,
    AxumPath(playlist_id): AxumPath<String>,
) -> ApiResult<PlaylistDetail> {
    let playlist = state.core.get_playlist_by_id(&playlist_id).await?;
    Ok(ApiResponse::ok(playlist, "Playlist fetched successfully"))
}

async fn update_playlist(
    State(state): State<AppState>,
    Actor(actor): Actor,
    AxumPath(playlist_id): AxumPath<String>,
    payload: Result<Json<PlaylistBody>, JsonRejection>,
) -> ApiResult<Playlist> {
    let input = body(payload)?;
    let playlist = state
        .core
        .update_playlist(actor, &playlist_id, &input.name, &input.description)
        .await?;
    Ok(ApiResponse::ok(playlist, "Playlist updated successfully"))
}

async fn delete_playlist(
    State(state): State<AppState>,
    Actor(actor): Actor,
    AxumPath(playlist_id): AxumPath<String>,
) -> ApiResult<()> {
    state.core.delete_playlist(actor, &playlist_id).await?;
    Ok(ApiResponse::ok((), "Playlist deleted successfully"))
}

async fn add_to_playlist(
    State(state): State<AppState>,
    Actor(actor): Actor,
    AxumPath((video_id, playlist_id)): AxumPath<(String, String)>,
) -> ApiResult<Playlist> {
    let playlist = state
        .core
        .add_video_to_playlist(actor, &playlist_id, &video_id)
        .await?;
    Ok(ApiResponse::ok(playlist, "Video added to playlist"))
}

async fn remove_from_playlist(
    State(state): State<AppState>,
    Actor(actor): Actor,
    AxumPath((video_id, playlist_id)): AxumPath<(String, String)>,
) -> ApiResult<Playlist> {
    let playlist = state
        .core
        .remove_video_from_playlist(actor, &playlist_id, &video_id)
        .await?;
    Ok(ApiResponse::ok(playlist, "Video removed from playlist"))
}

async fn user_playlists(
    State(state): State<AppState>,
    AxumPath(user_id): AxumPath<String>,
) -> ApiResult<Vec<PlaylistSummary>> {
    let playlists = state.core.get_user_playlists(&user_id).await?;
    Ok(ApiResponse::ok(playlists, "Playlists fetched successfully"))
}

async fn serve_media(
    State(state): State<AppState>,
    AxumPath((kind, file)): AxumPath<(String, String)>,
) -> CoreResult<Response> {
    let kind = BlobKind::parse(&kind).ok_or_else(|| CoreError::not_found("file not found"))?;
    let path = state.blobs.resolve(kind, &file)?;
    stream_file(path).await
}

async fn stream_file(path: PathBuf) -> CoreResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| CoreError::not_found("file not found"))?;

    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);
    let mut response = body.into_response();
    if let Some(mime) = MimeGuess::from_path(&path).first() {
        if let Ok(value) = mime.to_string().parse() {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
    }

    Ok(response)
}
