//! Queue of path requests served by time-sliced searches
//!
//! Requests are processed round-robin with a per-update iteration budget. Only one
//! search is active at a time since all requests share a single query object.

use crate::{NavMesh, NavMeshQuery, PolyRef, QueryFilter, SlicedPathState, Status};

const MAX_QUEUE: usize = 8;

/// Number of updates a finished request is kept before its slot is reclaimed
const MAX_KEEP_ALIVE: u32 = 2;

/// Handle to a queued path request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathQueueRef(u32);

impl PathQueueRef {
    pub fn id(&self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryState {
    Pending,
    Searching,
    Done(Status),
}

#[derive(Debug, Clone)]
struct PathQuery {
    reference: Option<PathQueueRef>,
    start_pos: [f32; 3],
    end_pos: [f32; 3],
    start_ref: PolyRef,
    end_ref: PolyRef,
    path: Vec<PolyRef>,
    state: QueryState,
    keep_alive: u32,
    filter: QueryFilter,
}

impl Default for PathQuery {
    fn default() -> Self {
        Self {
            reference: None,
            start_pos: [0.0; 3],
            end_pos: [0.0; 3],
            start_ref: PolyRef::NULL,
            end_ref: PolyRef::NULL,
            path: Vec::new(),
            state: QueryState::Done(Status::Failure),
            keep_alive: 0,
            filter: QueryFilter::default(),
        }
    }
}

/// Fixed-capacity queue of asynchronous path requests
#[derive(Debug, Clone)]
pub struct PathQueue<'a> {
    queue: [PathQuery; MAX_QUEUE],
    next_handle: u32,
    max_path_size: usize,
    queue_head: usize,
    nav_query: NavMeshQuery<'a>,
}

impl<'a> PathQueue<'a> {
    pub fn new(nav_mesh: &'a NavMesh, max_path_size: usize, max_search_nodes: usize) -> Self {
        Self {
            queue: Default::default(),
            next_handle: 1,
            max_path_size: max_path_size.max(1),
            queue_head: 0,
            nav_query: NavMeshQuery::with_max_nodes(nav_mesh, max_search_nodes),
        }
    }

    /// Queues a path request. Returns `None` when every slot is taken.
    pub fn request(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
    ) -> Option<PathQueueRef> {
        let slot = self.queue.iter().position(|q| q.reference.is_none())?;

        let reference = PathQueueRef(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1).max(1);

        let query = &mut self.queue[slot];
        query.reference = Some(reference);
        query.start_ref = start_ref;
        query.end_ref = end_ref;
        query.start_pos = *start_pos;
        query.end_pos = *end_pos;
        query.state = QueryState::Pending;
        query.keep_alive = 0;
        query.filter = filter.clone();
        query.path.clear();

        Some(reference)
    }

    /// Advances queued searches, spending at most `max_iters` search iterations.
    pub fn update(&mut self, max_iters: usize) {
        let mut iter_left = max_iters;

        for _ in 0..MAX_QUEUE {
            let head = self.queue_head % MAX_QUEUE;
            let query = &mut self.queue[head];

            if query.reference.is_none() {
                self.queue_head += 1;
                continue;
            }

            if let QueryState::Done(_) = query.state {
                // Results nobody collected expire
                query.keep_alive += 1;
                if query.keep_alive > MAX_KEEP_ALIVE {
                    query.reference = None;
                    query.state = QueryState::Done(Status::Failure);
                }
                self.queue_head += 1;
                continue;
            }

            if query.state == QueryState::Pending {
                query.state = match self.nav_query.init_sliced_find_path(
                    query.start_ref,
                    query.end_ref,
                    &query.start_pos,
                    &query.end_pos,
                    &query.filter,
                ) {
                    Ok(_) => QueryState::Searching,
                    Err(_) => QueryState::Done(Status::Failure),
                };
            }

            if query.state == QueryState::Searching {
                match self.nav_query.update_sliced_find_path(iter_left) {
                    Ok((iters, state)) => {
                        iter_left = iter_left.saturating_sub(iters);
                        if state != SlicedPathState::InProgress {
                            query.state = match self.nav_query.finalize_sliced_find_path(self.max_path_size) {
                                Ok(path) => {
                                    query.path = path;
                                    QueryState::Done(state.status())
                                }
                                Err(_) => QueryState::Done(Status::Failure),
                            };
                        }
                    }
                    Err(_) => query.state = QueryState::Done(Status::Failure),
                }
            }

            if iter_left == 0 {
                break;
            }
            self.queue_head += 1;
        }
    }

    /// Status of a request. Unknown handles report failure.
    pub fn request_status(&self, reference: PathQueueRef) -> Status {
        match self.queue.iter().find(|q| q.reference == Some(reference)) {
            Some(query) => match query.state {
                QueryState::Done(status) => status,
                QueryState::Pending | QueryState::Searching => Status::InProgress,
            },
            None => Status::Failure,
        }
    }

    /// Takes the result of a finished request and frees its slot.
    pub fn path_result(&mut self, reference: PathQueueRef) -> (Status, Vec<PolyRef>) {
        let Some(query) = self.queue.iter_mut().find(|q| q.reference == Some(reference)) else {
            return (Status::Failure, Vec::new());
        };
        let QueryState::Done(status) = query.state else {
            return (Status::InProgress, Vec::new());
        };

        query.reference = None;
        query.state = QueryState::Done(Status::Failure);
        (status, std::mem::take(&mut query.path))
    }

    pub fn nav_query(&self) -> &NavMeshQuery<'a> {
        &self.nav_query
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::create_grid_mesh;

    #[test]
    fn test_request_completes_over_updates() {
        let mesh = create_grid_mesh(20, 1, 1.0);
        let mut queue = PathQueue::new(&mesh, 64, 256);
        let filter = QueryFilter::default();
        let r = queue
            .request(
                PolyRef::new(1),
                PolyRef::new(20),
                &[0.5, 0.0, 0.5],
                &[19.5, 0.0, 0.5],
                &filter,
            )
            .unwrap();

        queue.update(5);
        assert_eq!(queue.request_status(r), Status::InProgress);

        let mut updates = 0;
        while queue.request_status(r) == Status::InProgress && updates < 20 {
            queue.update(5);
            updates += 1;
        }
        assert_eq!(queue.request_status(r), Status::Success);

        let (status, path) = queue.path_result(r);
        assert_eq!(status, Status::Success);
        assert_eq!(path.len(), 20);
        assert_eq!(path[0], PolyRef::new(1));
        assert_eq!(path[19], PolyRef::new(20));

        // Slot is freed once the result is taken
        assert_eq!(queue.request_status(r), Status::Failure);
    }

    #[test]
    fn test_full_queue_rejects_requests() {
        let mesh = create_grid_mesh(2, 1, 1.0);
        let mut queue = PathQueue::new(&mesh, 8, 64);
        let filter = QueryFilter::default();
        for _ in 0..MAX_QUEUE {
            assert!(queue
                .request(PolyRef::new(1), PolyRef::new(2), &[0.5, 0.0, 0.5], &[1.5, 0.0, 0.5], &filter)
                .is_some());
        }
        assert!(queue
            .request(PolyRef::new(1), PolyRef::new(2), &[0.5, 0.0, 0.5], &[1.5, 0.0, 0.5], &filter)
            .is_none());
    }

    #[test]
    fn test_uncollected_results_expire() {
        let mesh = create_grid_mesh(2, 1, 1.0);
        let mut queue = PathQueue::new(&mesh, 8, 64);
        let filter = QueryFilter::default();
        let r = queue
            .request(PolyRef::new(1), PolyRef::new(2), &[0.5, 0.0, 0.5], &[1.5, 0.0, 0.5], &filter)
            .unwrap();
        queue.update(10);
        assert_eq!(queue.request_status(r), Status::Success);
        for _ in 0..=MAX_KEEP_ALIVE {
            queue.update(10);
        }
        assert_eq!(queue.request_status(r), Status::Failure);
    }

    #[test]
    fn test_invalid_request_fails() {
        let mesh = create_grid_mesh(2, 1, 1.0);
        let mut queue = PathQueue::new(&mesh, 8, 64);
        let r = queue
            .request(
                PolyRef::new(1),
                PolyRef::new(99),
                &[0.5, 0.0, 0.5],
                &[1.5, 0.0, 0.5],
                &QueryFilter::default(),
            )
            .unwrap();
        queue.update(10);
        assert_eq!(queue.request_status(r), Status::Failure);
    }
}
