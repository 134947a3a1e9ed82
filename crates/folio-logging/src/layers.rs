//! Tracing layers for Folio

use tracing::{Subscriber, span};
use tracing_subscriber::{
    layer::{Context, Layer},
    registry::LookupSpan,
};

use crate::context::{SessionContextData, SessionContextGuard};

/// Attaches the active session to every new span
///
/// The data is stored as a span extension so other layers can read it.
#[derive(Debug, Default)]
pub struct SessionContextLayer;

impl SessionContextLayer {
    pub fn new() -> Self {
        Self
    }
}

/// Span extension holding the session a span was created in
#[derive(Debug, Clone)]
pub struct SessionContextExtension {
    pub data: SessionContextData,
}

impl<S> Layer<S> for SessionContextLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, _attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let inherited = span.parent().and_then(|parent| {
            parent
                .extensions()
                .get::<SessionContextExtension>()
                .cloned()
        });
        let extension = SessionContextGuard::current()
            .map(|data| SessionContextExtension { data })
            .or(inherited);
        if let Some(extension) = extension {
            span.extensions_mut().insert(extension);
        }
    }
}
