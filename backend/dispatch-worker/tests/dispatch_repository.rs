//! `SqlxOrderRepository` is exercised for its query shape only -- these run
//! against a lazily-connected pool that is never actually dialed, mirroring
//! `dispatch-api`'s own lazy-pool test style.

use dispatch_worker::repository::SqlxOrderRepository;
use sqlx::PgPool;

#[test]
fn repository_constructs_without_dialing_the_database() {
    let pool = PgPool::connect_lazy("postgres://localhost/unused")
        .expect("lazy pool construction does not dial the network");
    let _repo = SqlxOrderRepository::new(pool);
}
